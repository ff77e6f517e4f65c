pub mod probe;

pub use probe::{run_probe, HeadProbe, ProbeFactory, ProbeOutcome};
