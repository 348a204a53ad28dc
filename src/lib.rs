//! Collection orchestration for a generational, adaptively sized and
//! optionally concurrent garbage collector.
//!
//! The crate decides when and what to collect. Object layout, tracing and
//! thread suspension belong to the embedding runtime and are reached through
//! the traits in [`runtime`] and [`header`].

/// Collection summaries go to `info` when the heap is verbose and to `debug` otherwise.
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

pub mod collection_barrier;
pub mod collector;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod finalization;
pub mod gen_mode;
pub mod header;
pub mod heap;
pub mod mmap;
pub mod object;
pub mod phase;
pub mod runtime;
pub mod safepoint;
pub mod space;
pub mod statistics;
pub mod strategy;
pub mod tuner;
pub mod util;

pub use collector::{CollectionKind, CompletionPath, GcCause};
pub use concurrent::barrier::MutatorBuffer;
pub use config::{AlgorithmKind, ConcurrentVariant, Config, Tuning};
pub use error::{AllocationError, ConfigError};
pub use finalization::{ReferenceEntry, ReferenceKind};
pub use gen_mode::GenMode;
pub use header::{CollectionMetadata, SideTableMetadata};
pub use heap::Heap;
pub use object::ObjectRef;
pub use phase::ConcurrentPhase;
pub use runtime::{Collaborators, MutatorRuntime, ObjectGraph};
pub use space::RegionKind;
