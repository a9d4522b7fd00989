//! In-device automation primitives.
//!
//! Timers fire on a schedule program with a predicate gate, pairings
//! reactively bind two properties through RPN transforms, and rules
//! evaluate condition lists into action dispatch. All three are
//! things themselves, created and owned by manager traits on a root
//! thing, and all of them reach other things purely through URI
//! resource links, so an automation can drive anything the namespace
//! can address.
pub mod action;
pub mod manager;
pub mod pairing;
pub mod rtc;
pub mod rule;
pub mod timer;

#[cfg(test)]
mod test;

pub use action::{Action, ActionList, ActionsTrait, TrapSink};
pub use manager::{ChildReaper, GroupManagerTrait, ManagedChild, ManagerTrait};
pub use pairing::LocalPairing;
pub use rule::LocalRule;
pub use timer::LocalTimer;
