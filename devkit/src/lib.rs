/*!
# Telemetry DevKit - test doubles for the producer/consumer pair

Helpers for exercising both roles without a broker or a real host probe:
- Mock point session recording transmissions and simulating inbound updates
- Scripted resource probe
- Temp-dir harness with a fast config and store readers
*/

pub mod point_stub;
pub mod test_utils;

pub use point_stub::{MockPointSession, SentValue};
pub use test_utils::{ScriptedProbe, TestHarness};
