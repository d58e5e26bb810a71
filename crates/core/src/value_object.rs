//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attributes. In the
/// ledger a `Voucher` record is a value object; a `MemberAccount` or a `Loan`
/// is an entity.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
