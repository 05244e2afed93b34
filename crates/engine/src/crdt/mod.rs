//! Conflict-free replicated data types
//!
//! Six independently convergent primitives back the scene document:
//! LWW-Register, LWW-Map, G-Counter, PN-Counter, OR-Set and RGA. Each owns
//! a vector clock, applies remote operations idempotently, and breaks every
//! tie on `(counter, client_id)`, never on receipt order or wall-clock
//! time, which is what makes the merges deterministic and associative.

mod counter;
mod map;
mod orset;
mod register;
mod rga;

pub use counter::{GCounter, PnCounter};
pub use map::{Entry, LwwMap};
pub use orset::{OrSet, SetOp};
pub use register::LwwRegister;
pub use rga::{Rga, RgaElement, RgaOp};

/// Whole-state anti-entropy merge.
///
/// Merging must be commutative, associative and idempotent, and must equal
/// the result of replaying every operation that produced `other`'s state.
pub trait Crdt {
    fn merge(&mut self, other: &Self);
}
