/// Global `tracing` subscriber setup for the hub binaries.
pub mod loggerhub;
