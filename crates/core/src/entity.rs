//! Records that keep their identity while their state changes.

/// A lot stays the same lot as its quantity drains; a movement keeps its id
/// forever. Both are looked up by `id()`.
pub trait Entity {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
