//! Test fixtures.

mod two_party;

pub use two_party::{
    Delivery, Outbox, Party, PartyOptions, PRIMARY_PORT, PRIMARY_V4, Recorder, StateRecord,
    TwoPartyFixture, call_key, fast_config, primary, relay,
};
