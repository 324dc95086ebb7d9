//! Type-keyed run memory
//!
//! Each workflow run owns a memory: a mapping from runtime type to value.
//! Steps read their inputs out of it by type and write their outputs back in.
//! Keys are unique by type; re-adding a type overwrites. Tuples are flattened
//! element-wise on both rails: storing `(A, B)` stores an `A` and a `B`, and a
//! step declaring input `(A, B)` synthesizes it from the individual slots.
//!
//! Memory slots are tracked statically: payload types opt in with
//! [`memory_value!`], which wires up the typed extraction and storage traits.
//! A missing slot is a workflow-structural error, surfaced immediately.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::error::CoreError;

/// Marker for a single value slot in run memory
///
/// Implement via [`memory_value!`]; the trait itself carries no behavior
/// beyond the bounds memory storage needs.
pub trait MemoryValue: Clone + Send + Sync + 'static {}

/// Types a step can pull from memory as its input
pub trait FromMemory: Sized + Send + Sync + 'static {
    fn take(memory: &RunMemory) -> Result<Self, CoreError>;

    /// Element type names, for diagnostics and step records.
    fn type_names() -> Vec<&'static str>;
}

/// Types a step can store into memory as its output
pub trait IntoMemory: Send + Sync + 'static {
    fn store(self, memory: &mut RunMemory);

    /// Element type names, for diagnostics and step records.
    fn type_names() -> Vec<&'static str>;
}

/// Wire a payload type into run memory.
///
/// ```
/// use trellis_core::memory_value;
///
/// #[derive(Clone, serde::Serialize)]
/// struct Order { id: u64 }
///
/// memory_value!(Order);
/// ```
#[macro_export]
macro_rules! memory_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::memory::MemoryValue for $ty {}

            impl $crate::memory::FromMemory for $ty {
                fn take(memory: &$crate::memory::RunMemory) -> Result<Self, $crate::error::CoreError> {
                    memory.get::<$ty>()
                }

                fn type_names() -> Vec<&'static str> {
                    vec![$crate::memory::slot_name::<$ty>()]
                }
            }

            impl $crate::memory::IntoMemory for $ty {
                fn store(self, memory: &mut $crate::memory::RunMemory) {
                    memory.put(self);
                }

                fn type_names() -> Vec<&'static str> {
                    vec![$crate::memory::slot_name::<$ty>()]
                }
            }
        )*
    };
}

macro_rules! tuple_memory {
    ($($name:ident),+) => {
        impl<$($name: MemoryValue),+> FromMemory for ($($name,)+) {
            fn take(memory: &RunMemory) -> Result<Self, CoreError> {
                Ok(($(memory.get::<$name>()?,)+))
            }

            fn type_names() -> Vec<&'static str> {
                vec![$(slot_name::<$name>()),+]
            }
        }

        impl<$($name: MemoryValue),+> IntoMemory for ($($name,)+) {
            #[allow(non_snake_case)]
            fn store(self, memory: &mut RunMemory) {
                let ($($name,)+) = self;
                $(memory.put($name);)+
            }

            fn type_names() -> Vec<&'static str> {
                vec![$(slot_name::<$name>()),+]
            }
        }
    };
}

tuple_memory!(A);
tuple_memory!(A, B);
tuple_memory!(A, B, C);
tuple_memory!(A, B, C, D);

// The unit value is seeded into every run on activation.
memory_value!(());
memory_value!(String);
memory_value!(serde_json::Value);

/// Short display name for a memory slot type.
pub fn slot_name<T: ?Sized>() -> &'static str {
    crate::short_type_name::<T>()
}

struct Slot {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Per-run, type-keyed value store
#[derive(Default)]
pub struct RunMemory {
    slots: HashMap<TypeId, Slot>,
}

impl RunMemory {
    /// Empty memory pre-seeded with the unit value.
    pub fn new() -> Self {
        let mut memory = Self {
            slots: HashMap::new(),
        };
        memory.put(());
        memory
    }

    /// Store a value, overwriting any previous slot of the same type.
    pub fn put<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.slots.insert(
            TypeId::of::<T>(),
            Slot {
                value: Box::new(value),
                type_name: slot_name::<T>(),
            },
        );
    }

    /// Clone the value stored for `T`, or fail with a structural error.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<T, CoreError> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.value.downcast_ref::<T>())
            .cloned()
            .ok_or_else(CoreError::missing_memory::<T>)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.slots.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Names of every occupied slot, for diagnostics.
    pub fn slot_names(&self) -> Vec<&'static str> {
        self.slots.values().map(|slot| slot.type_name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    struct Order {
        id: u64,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    struct Receipt {
        total: u64,
    }

    memory_value!(Order, Receipt);

    #[test]
    fn activation_seeds_the_unit_value() {
        let memory = RunMemory::new();
        assert!(memory.contains::<()>());
        assert_eq!(memory.get::<()>().unwrap(), ());
    }

    #[test]
    fn put_overwrites_by_type() {
        let mut memory = RunMemory::new();
        memory.put(Order { id: 1 });
        memory.put(Order { id: 2 });
        assert_eq!(memory.get::<Order>().unwrap(), Order { id: 2 });
    }

    #[test]
    fn missing_slot_is_a_structural_error() {
        let memory = RunMemory::new();
        let err = memory.get::<Order>().unwrap_err();
        assert!(matches!(
            err,
            CoreError::MissingMemory { type_name: "Order" }
        ));
    }

    #[test]
    fn tuples_flatten_on_store() {
        let mut memory = RunMemory::new();
        (Order { id: 7 }, Receipt { total: 40 }).store(&mut memory);
        assert_eq!(memory.get::<Order>().unwrap().id, 7);
        assert_eq!(memory.get::<Receipt>().unwrap().total, 40);
    }

    #[test]
    fn tuples_synthesize_on_take() {
        let mut memory = RunMemory::new();
        memory.put(Order { id: 7 });
        memory.put(Receipt { total: 40 });

        let (order, receipt) = <(Order, Receipt)>::take(&memory).unwrap();
        assert_eq!(order.id, 7);
        assert_eq!(receipt.total, 40);

        // One missing element fails the whole synthesis.
        let memory = RunMemory::new();
        assert!(<(Order, Receipt)>::take(&memory).is_err());
    }

    #[test]
    fn type_names_track_tuple_elements() {
        assert_eq!(
            <(Order, Receipt) as FromMemory>::type_names(),
            vec!["Order", "Receipt"]
        );
        assert_eq!(<Order as FromMemory>::type_names(), vec!["Order"]);
    }
}
