//! Multi-node fixtures

mod two_node;

pub use two_node::{FixtureOptions, RecordingPower, TwoNodeFixture};
