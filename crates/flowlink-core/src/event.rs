//! Event contract
//!
//! An event is the unit of work routed between flows and across links. Every
//! event carries a stable integer type id, a routing handle (the session it came
//! from or is going to, `0` for none), a fingerprint marking which of its fields
//! were explicitly set, and a flag saying whether this instance may be passed
//! through a channel transform.
//!
//! Concrete events are declared with [`define_event!`](crate::define_event).

use core::any::Any;
use core::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::varint;
use crate::Result;

/// Maximum number of fingerprinted fields per event
pub const MAX_EVENT_FIELDS: usize = 64;

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// Bitset of explicitly set event fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Create an empty fingerprint
    pub const fn new() -> Self {
        Self(0)
    }

    /// Create a fingerprint from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Whether field `index` is set
    pub fn get(&self, index: usize) -> bool {
        index < MAX_EVENT_FIELDS && self.0 & (1 << index) != 0
    }

    /// Mark field `index` as set
    pub fn touch(&mut self, index: usize) {
        debug_assert!(index < MAX_EVENT_FIELDS);
        self.0 |= 1 << index;
    }

    /// Mark field `index` as unset
    pub fn wipe(&mut self, index: usize) {
        debug_assert!(index < MAX_EVENT_FIELDS);
        self.0 &= !(1 << index);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of set fields
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Whether every field set here is also set in `other`
    pub fn is_subset_of(&self, other: &Fingerprint) -> bool {
        self.0 & other.0 == self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

// ----------------------------------------------------------------------------
// Event Header
// ----------------------------------------------------------------------------

/// State every event carries besides its own fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Routing handle of the originating or target session (0 = none)
    pub handle: u64,
    /// Which fields were explicitly set
    pub fingerprint: Fingerprint,
    /// Whether this instance may pass through a channel transform
    pub transform_eligible: bool,
}

impl Default for EventHeader {
    fn default() -> Self {
        Self {
            handle: 0,
            fingerprint: Fingerprint::new(),
            transform_eligible: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Trait
// ----------------------------------------------------------------------------

/// Message unit routed between flows and sessions
pub trait Event: Send + Sync + fmt::Debug + 'static {
    /// Stable per-type integer id
    fn event_type(&self) -> i32;

    /// Rust type name, for logging
    fn type_name(&self) -> &'static str;

    fn header(&self) -> &EventHeader;

    fn header_mut(&mut self) -> &mut EventHeader;

    /// Write the set fields in declaration order
    fn serialize_fields(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Read the fields marked in the already decoded fingerprint
    fn deserialize_fields(&mut self, input: &mut &[u8]) -> Result<()>;

    /// Compare the fields set in `self` against `other` (same concrete type)
    fn fields_equivalent(&self, other: &dyn Event) -> bool;

    fn boxed_clone(&self) -> Box<dyn Event>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    fn handle(&self) -> u64 {
        self.header().handle
    }

    fn set_handle(&mut self, handle: u64) {
        self.header_mut().handle = handle;
    }

    fn fingerprint(&self) -> Fingerprint {
        self.header().fingerprint
    }

    fn transform_eligible(&self) -> bool {
        self.header().transform_eligible
    }

    fn set_transform_eligible(&mut self, eligible: bool) {
        self.header_mut().transform_eligible = eligible;
    }

    /// Serialize the fingerprint followed by the set fields
    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        varint::write_u64(out, self.fingerprint().bits());
        self.serialize_fields(out)
    }

    /// Deserialize the fingerprint and the fields it marks
    fn deserialize(&mut self, input: &mut &[u8]) -> Result<()> {
        let bits = varint::read_u64(input)?;
        self.header_mut().fingerprint = Fingerprint::from_bits(bits);
        self.deserialize_fields(input)
    }

    /// Structural match: same type, the handle if `self` has one, and every field
    /// `self` explicitly set is set in `other` with an equal value
    fn equivalent(&self, other: &dyn Event) -> bool {
        if self.event_type() != other.event_type() {
            return false;
        }
        if self.handle() != 0 && self.handle() != other.handle() {
            return false;
        }
        if !self.fingerprint().is_subset_of(&other.fingerprint()) {
            return false;
        }
        self.fields_equivalent(other)
    }
}

impl dyn Event {
    /// Downcast to a concrete event type
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast an owned event, handing it back on mismatch
    pub fn downcast<T: Event>(self: Box<Self>) -> core::result::Result<Box<T>, Box<dyn Event>> {
        if self.is::<T>() {
            match self.into_any().downcast::<T>() {
                Ok(event) => Ok(event),
                Err(_) => unreachable!("type checked above"),
            }
        } else {
            Err(self)
        }
    }
}

impl Clone for Box<dyn Event> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

// ----------------------------------------------------------------------------
// Event Declaration Macro
// ----------------------------------------------------------------------------

/// Declare an event type.
///
/// Each field gets a getter named after the field and an in-place setter that
/// marks the field in the fingerprint.
///
/// ```
/// flowlink_core::define_event! {
///     /// Greeting sent on login
///     pub struct Hello = 100 {
///         name: String => set_name,
///         age: u32 => set_age,
///     }
/// }
///
/// let mut hello = Hello::new();
/// hello.set_name("ada".to_string());
/// assert_eq!(hello.name(), "ada");
/// ```
#[macro_export]
macro_rules! define_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $type_id:literal {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty => $setter:ident
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            header: $crate::event::EventHeader,
            $( $(#[$fmeta])* $field: $ty, )*
        }

        impl $name {
            pub const TYPE_ID: i32 = $type_id;

            #[allow(dead_code)]
            const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            pub fn new() -> Self {
                Self::default()
            }

            #[allow(dead_code)]
            fn field_index(name: &str) -> usize {
                Self::FIELD_NAMES
                    .iter()
                    .position(|candidate| *candidate == name)
                    .unwrap_or(usize::MAX)
            }

            $(
                pub fn $field(&self) -> &$ty {
                    &self.$field
                }

                pub fn $setter(&mut self, value: $ty) -> &mut Self {
                    self.$field = value;
                    self.header.fingerprint.touch(Self::field_index(stringify!($field)));
                    self
                }
            )*

            /// Builder-style routing handle
            pub fn with_handle(mut self, handle: u64) -> Self {
                self.header.handle = handle;
                self
            }
        }

        impl $crate::event::Event for $name {
            fn event_type(&self) -> i32 {
                Self::TYPE_ID
            }

            fn type_name(&self) -> &'static str {
                stringify!($name)
            }

            fn header(&self) -> &$crate::event::EventHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut $crate::event::EventHeader {
                &mut self.header
            }

            #[allow(unused_variables)]
            fn serialize_fields(&self, out: &mut Vec<u8>) -> $crate::Result<()> {
                let fingerprint = self.header.fingerprint;
                $(
                    if fingerprint.get(Self::field_index(stringify!($field))) {
                        $crate::__bincode::serialize_into(&mut *out, &self.$field)?;
                    }
                )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn deserialize_fields(&mut self, input: &mut &[u8]) -> $crate::Result<()> {
                let fingerprint = self.header.fingerprint;
                $(
                    if fingerprint.get(Self::field_index(stringify!($field))) {
                        self.$field = $crate::__bincode::deserialize_from(&mut *input).map_err(|e| {
                            $crate::errors::WireError::Field {
                                field: stringify!($field),
                                reason: e.to_string(),
                            }
                        })?;
                    }
                )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn fields_equivalent(&self, other: &dyn $crate::event::Event) -> bool {
                let Some(other) = other.as_any().downcast_ref::<$name>() else {
                    return false;
                };
                let fingerprint = self.header.fingerprint;
                $(
                    if fingerprint.get(Self::field_index(stringify!($field)))
                        && self.$field != other.$field
                    {
                        return false;
                    }
                )*
                true
            }

            fn boxed_clone(&self) -> Box<dyn $crate::event::Event> {
                Box::new(self.clone())
            }

            fn as_any(&self) -> &dyn core::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn core::any::Any> {
                self
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::define_event! {
        /// Test event with a few fields
        pub struct Sample = 9001 {
            name: String => set_name,
            count: u32 => set_count,
            tags: Vec<String> => set_tags,
        }
    }

    #[test]
    fn test_setters_touch_fingerprint() {
        let mut sample = Sample::new();
        assert!(sample.fingerprint().is_empty());

        sample.set_count(3);
        assert!(sample.fingerprint().get(1));
        assert!(!sample.fingerprint().get(0));
        assert_eq!(*sample.count(), 3);
        assert!(sample.transform_eligible());
    }

    #[test]
    fn test_partial_serialization_only_writes_set_fields() {
        let mut sample = Sample::new();
        sample.set_name("alpha".to_string());

        let mut bytes = Vec::new();
        sample.serialize(&mut bytes).unwrap();

        let mut decoded = Sample::new();
        let mut input = bytes.as_slice();
        decoded.deserialize(&mut input).unwrap();
        assert!(input.is_empty());
        assert_eq!(decoded.name(), "alpha");
        assert_eq!(decoded.fingerprint(), sample.fingerprint());
        assert!(!decoded.fingerprint().get(1));
    }

    #[test]
    fn test_equivalence_is_restricted_to_template_fields() {
        let mut template = Sample::new();
        template.set_name("alpha".to_string());

        let mut candidate = Sample::new();
        candidate.set_name("alpha".to_string()).set_count(42);
        assert!(template.equivalent(&candidate));
        assert!(!candidate.equivalent(&template));

        candidate.set_name("beta".to_string());
        assert!(!template.equivalent(&candidate));
    }

    #[test]
    fn test_equivalence_honours_template_handle() {
        let template = Sample::new().with_handle(7);
        let mut candidate = Sample::new();
        assert!(!template.equivalent(&candidate));
        candidate.set_handle(7);
        assert!(template.equivalent(&candidate));
        assert!(Sample::new().equivalent(&candidate));
    }

    #[test]
    fn test_downcast_owned_event() {
        let boxed: Box<dyn Event> = Box::new(Sample::new());
        let sample = boxed.downcast::<Sample>().unwrap();
        assert_eq!(sample.event_type(), Sample::TYPE_ID);
    }
}
