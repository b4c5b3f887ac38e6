//! Durable protocol-state records and their state machines.
//!
//! Each record type owns its lifecycle: transitions go through the
//! record's own methods, which enforce the allowed state graph and
//! advance `updated_at`. Handlers load records, call guards
//! (`assert_state`, `assert_role`, `assert_connection`), mutate, and
//! persist through the [`crate::storage::RecordStore`].

mod connection;
pub mod error;
mod mediation;
mod out_of_band;
mod proof;

pub use connection::{ConnectionRecord, ConnectionRole, ConnectionState};
pub use error::StateError;
pub use mediation::{MediationRecord, MediationRole, MediationState};
pub use out_of_band::{
    OobService, OutOfBandInvitation, OutOfBandRecord, OutOfBandRole, OutOfBandState,
};
pub use proof::{AutoAcceptProof, ProofExchangeRecord, ProofState};
