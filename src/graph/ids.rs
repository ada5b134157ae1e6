use std::fmt;
use std::num::NonZero;

/// Define an ID type for entries in one of the [`Program`](super::Program)
/// arenas.
///
/// IDs are stored as `index + 1` so that `Option<Id>` is the same size as
/// `Id`.
macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(NonZero<u32>);

        impl $name {
            /// Return the arena index of this ID.
            pub fn as_usize(self) -> usize {
                (self.0.get() - 1) as usize
            }

            pub(crate) fn from_index(index: usize) -> $name {
                let value = u32::try_from(index)
                    .ok()
                    .and_then(|index| index.checked_add(1))
                    .and_then(NonZero::new);
                match value {
                    Some(value) => $name(value),
                    None => panic!("arena index {} out of range", index),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.as_usize())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.as_usize())
            }
        }
    };
}

arena_id!(
    /// ID of a variable.
    VarId,
    "v"
);

arena_id!(
    /// ID of an operation.
    OpId,
    "op"
);

arena_id!(
    /// ID of a function, including nested functions owned by control-flow
    /// operations.
    FunctionId,
    "fn"
);
