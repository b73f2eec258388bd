//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. An item
/// key is a value object: two keys with the same text denote the same item,
/// whereas two lots with identical quantities are still distinct entities.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct ItemKey(String);
///
/// impl ValueObject for ItemKey {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
