use std::time::Duration;

use crate::punch::DEFAULT_PUNCH_TRIES;

/// One STUN probe: a server plus the CHANGE-REQUEST flags sent to it.
#[derive(Debug, Clone)]
pub struct Probe {
    pub server: String,
    pub change_ip: bool,
    pub change_port: bool,
}

impl Probe {
    pub fn new(server: impl Into<String>, change_ip: bool, change_port: bool) -> Probe {
        Probe {
            server: server.into(),
            change_ip,
            change_port,
        }
    }
}

/// Tuning knobs for a tunnel session. `Default` carries the reference
/// values; the `set_*` chain overrides individual fields.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Probe table for classification. The first two entries must name two
    /// distinct servers; entries 2 and 3 revisit the first server with
    /// CHANGE-REQUEST flags.
    pub probes: Vec<Probe>,
    pub stun_rto: Duration,
    pub stun_max_sends: usize,
    pub handshake_timeout: Duration,
    pub punch_tries: usize,
    pub send_interval: Duration,
    pub spawn_interval: Duration,
    pub keepalive_interval: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            probes: vec![
                Probe::new("stun.miwifi.com:3478", false, false),
                Probe::new("stun.syncthing.net:3478", false, false),
                Probe::new("stun.miwifi.com:3478", true, true),
                Probe::new("stun.miwifi.com:3478", false, true),
            ],
            stun_rto: Duration::from_secs(1),
            stun_max_sends: 3,
            handshake_timeout: Duration::from_secs(30),
            punch_tries: DEFAULT_PUNCH_TRIES,
            send_interval: Duration::from_secs(1),
            spawn_interval: Duration::from_millis(1),
            keepalive_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_probes(mut self, probes: Vec<Probe>) -> Self {
        self.probes = probes;
        self
    }
    pub fn set_stun_rto(mut self, stun_rto: Duration) -> Self {
        self.stun_rto = stun_rto;
        self
    }
    pub fn set_stun_max_sends(mut self, stun_max_sends: usize) -> Self {
        self.stun_max_sends = stun_max_sends;
        self
    }
    pub fn set_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
    pub fn set_punch_tries(mut self, punch_tries: usize) -> Self {
        self.punch_tries = punch_tries;
        self
    }
    pub fn set_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }
    pub fn set_spawn_interval(mut self, spawn_interval: Duration) -> Self {
        self.spawn_interval = spawn_interval;
        self
    }
    pub fn set_keepalive_interval(mut self, keepalive_interval: Duration) -> Self {
        self.keepalive_interval = keepalive_interval;
        self
    }
    pub fn set_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}
