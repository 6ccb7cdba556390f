//! Macros for reducing identifier boilerplate.

/// Declare a UUID-backed identifier newtype.
///
/// The generated type is `Copy`, hashable, serializes transparently as its
/// UUID, and displays as the bare UUID so it drops straight into tracing
/// fields and SQL binds.
///
/// # Example
///
/// ```ignore
/// use ride_dispatch::uuid_id;
///
/// uuid_id! {
///     /// Identifies a vehicle.
///     pub struct VehicleId;
/// }
///
/// let id = VehicleId::new();
/// assert_eq!(VehicleId::from_uuid(id.as_uuid()), id);
/// ```
#[macro_export]
macro_rules! uuid_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        $vis struct $name(uuid::Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub const fn from_uuid(id: uuid::Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            pub const fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(id: uuid::Uuid) -> Self {
                Self(id)
            }
        }
    };
}
