//! Collection algorithms. Each one maps a collection kind to the trace and
//! reclaim operations of the object graph.
use crate::collector::CollectionKind;
use crate::config::AlgorithmKind;
use crate::gen_mode::GenMode;
use crate::header::CollectionMetadata;
use crate::object::ObjectRef;
use crate::runtime::{CollectionScope, ObjectGraph, ReclaimSummary, TraceMode, TraceRequest};
use crate::space::RegionKind;

pub trait CollectionStrategy: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    /// Whether the algorithm can collect the young region alone.
    fn supports_minor(&self) -> bool;

    fn trace_request<'a>(
        &self,
        kind: CollectionKind,
        roots: &'a [ObjectRef],
        remembered: &'a [ObjectRef],
    ) -> TraceRequest<'a>;

    fn reclaim(
        &self,
        kind: CollectionKind,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary;

    /// Full marking collection that replaces a minor collection which could not finish.
    fn escalation_request<'a>(&self, roots: &'a [ObjectRef]) -> TraceRequest<'a> {
        full_mark(roots)
    }

    fn escalation_reclaim(
        &self,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary {
        graph.compact(CollectionScope::Full, metadata)
    }
}

fn full_mark(roots: &[ObjectRef]) -> TraceRequest<'_> {
    TraceRequest {
        roots,
        scope: CollectionScope::Full,
        mode: TraceMode::Mark,
        remembered: None,
    }
}

fn evacuate_young<'a>(roots: &'a [ObjectRef], remembered: Option<&'a [ObjectRef]>) -> TraceRequest<'a> {
    TraceRequest {
        roots,
        scope: CollectionScope::Young,
        mode: TraceMode::Evacuate {
            target: RegionKind::Mature,
        },
        remembered,
    }
}

pub struct SemispaceCopy;

impl CollectionStrategy for SemispaceCopy {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SemispaceCopy
    }

    fn supports_minor(&self) -> bool {
        true
    }

    fn trace_request<'a>(
        &self,
        kind: CollectionKind,
        roots: &'a [ObjectRef],
        _remembered: &'a [ObjectRef],
    ) -> TraceRequest<'a> {
        match kind {
            CollectionKind::Minor(_) => evacuate_young(roots, None),
            CollectionKind::Major => full_mark(roots),
        }
    }

    fn reclaim(
        &self,
        kind: CollectionKind,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary {
        match kind {
            CollectionKind::Minor(_) => graph.sweep(CollectionScope::Young, metadata),
            CollectionKind::Major => graph.compact(CollectionScope::Full, metadata),
        }
    }
}

pub struct MarkSweep;

impl CollectionStrategy for MarkSweep {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::MarkSweep
    }

    fn supports_minor(&self) -> bool {
        false
    }

    fn trace_request<'a>(
        &self,
        _kind: CollectionKind,
        roots: &'a [ObjectRef],
        _remembered: &'a [ObjectRef],
    ) -> TraceRequest<'a> {
        full_mark(roots)
    }

    fn reclaim(
        &self,
        _kind: CollectionKind,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary {
        graph.sweep(CollectionScope::Full, metadata)
    }
}

pub struct MoveCompact;

impl CollectionStrategy for MoveCompact {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::MoveCompact
    }

    fn supports_minor(&self) -> bool {
        false
    }

    fn trace_request<'a>(
        &self,
        _kind: CollectionKind,
        roots: &'a [ObjectRef],
        _remembered: &'a [ObjectRef],
    ) -> TraceRequest<'a> {
        full_mark(roots)
    }

    fn reclaim(
        &self,
        _kind: CollectionKind,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary {
        graph.compact(CollectionScope::Full, metadata)
    }
}

pub struct Generational;

impl CollectionStrategy for Generational {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Generational
    }

    fn supports_minor(&self) -> bool {
        true
    }

    fn trace_request<'a>(
        &self,
        kind: CollectionKind,
        roots: &'a [ObjectRef],
        remembered: &'a [ObjectRef],
    ) -> TraceRequest<'a> {
        match kind {
            CollectionKind::Minor(GenMode::Generational) => evacuate_young(roots, Some(remembered)),
            CollectionKind::Minor(GenMode::NonGenerational) => evacuate_young(roots, None),
            CollectionKind::Major => full_mark(roots),
        }
    }

    fn reclaim(
        &self,
        kind: CollectionKind,
        graph: &dyn ObjectGraph,
        metadata: &dyn CollectionMetadata,
    ) -> ReclaimSummary {
        match kind {
            CollectionKind::Minor(_) => graph.sweep(CollectionScope::Young, metadata),
            CollectionKind::Major => graph.compact(CollectionScope::Full, metadata),
        }
    }
}

/// Strategy for `algorithm`, chosen once when the heap is created.
pub fn for_algorithm(algorithm: AlgorithmKind) -> Box<dyn CollectionStrategy> {
    match algorithm {
        AlgorithmKind::SemispaceCopy => Box::new(SemispaceCopy),
        AlgorithmKind::MarkSweep => Box::new(MarkSweep),
        AlgorithmKind::MoveCompact => Box::new(MoveCompact),
        AlgorithmKind::Generational => Box::new(Generational),
    }
}
