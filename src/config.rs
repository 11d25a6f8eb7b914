//! Runtime-tunable options (SPEC_FULL.md §6).
//!
//! Setters validate and silently keep the previous value on an invalid
//! update rather than returning a `Result` — matching the reference
//! implementation's preference for infallible, always-usable config structs
//! (`WebSocketConfig`/`ServerConfig`) over a config type that can fail to
//! construct.

/// Origin admission policy (SPEC_FULL.md §6 `allowOrigin`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowOrigin {
    /// `null` in the distilled spec: only same-host requests are accepted.
    SameHost,
    /// `"*"`: any Origin is accepted.
    Any,
    /// An explicit allow-list of exact Origin values.
    List(Vec<String>),
}

impl Default for AllowOrigin {
    fn default() -> Self {
        AllowOrigin::SameHost
    }
}

/// Text decoding applied to opcode-1 (text) payloads before they're handed
/// to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Base64,
    Hex,
    Binary,
    Utf16Le,
    Ucs2,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Utf8
    }
}

/// Every tunable named in SPEC_FULL.md §6, with the spec's defaults.
#[derive(Debug, Clone)]
pub struct Config {
    allow_origin: AllowOrigin,
    encoding: Encoding,
    limit_by_ip: u32,
    max_payload: u64,
    ping_delay_ms: u64,
    pong_timeout_ms: u64,
    session_expires_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            allow_origin: AllowOrigin::default(),
            encoding: Encoding::default(),
            limit_by_ip: 256,
            max_payload: 2_621_440,
            ping_delay_ms: 180_000,
            pong_timeout_ms: 5_000,
            session_expires_ms: 43_200_000,
        }
    }
}

impl Config {
    pub fn allow_origin(&self) -> &AllowOrigin {
        &self.allow_origin
    }

    pub fn set_allow_origin(&mut self, value: AllowOrigin) {
        self.allow_origin = value;
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, value: Encoding) {
        self.encoding = value;
    }

    /// `0` disables the per-IP cap; any value `< 1` the caller passes is
    /// clamped to the disabled state rather than rejected (SPEC_FULL.md §6:
    /// "`< 1` disables").
    pub fn limit_by_ip(&self) -> u32 {
        self.limit_by_ip
    }

    pub fn set_limit_by_ip(&mut self, value: i64) -> bool {
        self.limit_by_ip = value.max(0) as u32;
        true
    }

    pub fn max_payload(&self) -> u64 {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, value: i64) -> bool {
        self.max_payload = value.max(0) as u64;
        true
    }

    pub fn ping_delay_ms(&self) -> u64 {
        self.ping_delay_ms
    }

    /// Setting this reschedules the liveness manager's periodic ping task
    /// atomically (SPEC_FULL.md §4.4); the reschedule itself happens in
    /// [`crate::liveness::LivenessManager::set_ping_delay_ms`], which calls
    /// this setter internally.
    pub fn set_ping_delay_ms(&mut self, value: i64) -> bool {
        self.ping_delay_ms = value.max(0) as u64;
        true
    }

    pub fn pong_timeout_ms(&self) -> u64 {
        self.pong_timeout_ms
    }

    pub fn set_pong_timeout_ms(&mut self, value: i64) -> bool {
        self.pong_timeout_ms = value.max(0) as u64;
        true
    }

    pub fn session_expires_ms(&self) -> u64 {
        self.session_expires_ms
    }

    pub fn set_session_expires_ms(&mut self, value: i64) -> bool {
        self.session_expires_ms = value.max(0) as u64;
        true
    }
}
