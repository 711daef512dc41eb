use std::time::Duration;

/// Queue sizes and port deadlines for every session in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Frames buffered between `submit_audio` and the worker.
    pub inbound_capacity: usize,
    /// Events buffered between the worker and the transport.
    pub outbound_capacity: usize,
    pub transcriber_timeout: Duration,
    pub agent_timeout: Duration,
    pub synthesizer_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 64,
            outbound_capacity: 256,
            transcriber_timeout: Duration::from_secs(10),
            agent_timeout: Duration::from_secs(30),
            synthesizer_timeout: Duration::from_secs(30),
        }
    }
}
