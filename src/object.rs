use std::fmt;

/// Opaque reference to a managed object.
///
/// The collector never dereferences it. Addresses are expected to be aligned to
/// [`ObjectRef::ALIGNMENT`] so that forwarding targets can be packed into a
/// header word.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub const ALIGNMENT: usize = 8;

    #[inline(always)]
    pub const fn from_address(address: usize) -> Self {
        Self(address)
    }

    #[inline(always)]
    pub const fn address(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
