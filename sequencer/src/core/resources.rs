//! Scheduler resource request types and their PBS text forms.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Wall-clock limit, written as `HH:MM:SS` in directives and config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(Duration);

impl Walltime {
    pub const MAX_HOURS: u64 = 100_000;
    /// Largest accepted walltime, `100000:00:00`.
    pub const MAX: Walltime = Walltime(Duration::from_secs(Self::MAX_HOURS * 3600));

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for Walltime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [hours, minutes, seconds] = parts.as_slice() else {
            return Err(anyhow!("walltime must be HH:MM:SS (got '{s}')"));
        };
        let hours: u64 = hours
            .parse()
            .with_context(|| format!("walltime hours in '{s}'"))?;
        let minutes: u64 = minutes
            .parse()
            .with_context(|| format!("walltime minutes in '{s}'"))?;
        let seconds: u64 = seconds
            .parse()
            .with_context(|| format!("walltime seconds in '{s}'"))?;
        if minutes >= 60 || seconds >= 60 {
            return Err(anyhow!(
                "walltime minutes and seconds must be < 60 (got '{s}')"
            ));
        }
        let secs = hours
            .checked_mul(3600)
            .and_then(|h| h.checked_add(minutes * 60 + seconds))
            .filter(|secs| *secs <= Self::MAX.0.as_secs())
            .ok_or_else(|| anyhow!("walltime must be at most {} (got '{s}')", Self::MAX))?;
        Ok(Self::from_secs(secs))
    }
}

impl TryFrom<String> for Walltime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }
}

/// Memory unit as understood by PBS (binary multiples).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemUnit {
    B,
    Kb,
    Mb,
    Gb,
    Tb,
}

impl MemUnit {
    fn as_str(self) -> &'static str {
        match self {
            MemUnit::B => "b",
            MemUnit::Kb => "kb",
            MemUnit::Mb => "mb",
            MemUnit::Gb => "gb",
            MemUnit::Tb => "tb",
        }
    }

    fn multiplier(self) -> u64 {
        match self {
            MemUnit::B => 1,
            MemUnit::Kb => 1 << 10,
            MemUnit::Mb => 1 << 20,
            MemUnit::Gb => 1 << 30,
            MemUnit::Tb => 1 << 40,
        }
    }
}

/// Memory amount such as `32gb`. Keeps the unit it was written with so the
/// directive is emitted exactly as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemSize {
    value: u64,
    unit: MemUnit,
}

impl MemSize {
    pub fn new(value: u64, unit: MemUnit) -> Self {
        Self { value, unit }
    }

    pub fn gb(value: u64) -> Self {
        Self::new(value, MemUnit::Gb)
    }

    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.multiplier())
    }
}

impl FromStr for MemSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(anyhow!("memory size must start with a number (got '{s}')"));
        }
        let value: u64 = digits
            .parse()
            .with_context(|| format!("memory size in '{s}'"))?;
        let unit = match unit {
            "b" | "" => MemUnit::B,
            "kb" => MemUnit::Kb,
            "mb" => MemUnit::Mb,
            "gb" => MemUnit::Gb,
            "tb" => MemUnit::Tb,
            other => return Err(anyhow!("unknown memory unit '{other}' in '{s}'")),
        };
        Ok(Self { value, unit })
    }
}

impl TryFrom<String> for MemSize {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MemSize> for String {
    fn from(value: MemSize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MemSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.as_str())
    }
}

/// Scheduler notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailEvent {
    Abort,
    Begin,
    End,
}

impl MailEvent {
    fn flag(self) -> char {
        match self {
            MailEvent::Abort => 'a',
            MailEvent::Begin => 'b',
            MailEvent::End => 'e',
        }
    }
}

/// Render the `-m` flag string. Order is always `a`, `b`, `e`; no events is `n`.
pub fn mail_flags(events: &[MailEvent]) -> String {
    let mut sorted = events.to_vec();
    sorted.sort();
    sorted.dedup();
    if sorted.is_empty() {
        return "n".to_string();
    }
    sorted.into_iter().map(MailEvent::flag).collect()
}

/// Per-node resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub walltime: Walltime,
    pub nodes: u32,
    pub ncpus: u32,
    pub ngpus: u32,
    pub mem: MemSize,
    pub gpu_mem: MemSize,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            walltime: Walltime::from_secs(10 * 60),
            nodes: 1,
            ncpus: 8,
            ngpus: 4,
            mem: MemSize::gb(32),
            gpu_mem: MemSize::gb(32),
        }
    }
}

impl ResourceRequest {
    /// The `select=` chunk specification.
    pub fn select_spec(&self) -> String {
        format!(
            "select={}:ncpus={}:ngpus={}:mem={}:gpu_mem={}",
            self.nodes, self.ncpus, self.ngpus, self.mem, self.gpu_mem
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walltime_parses_and_formats() {
        let wt: Walltime = "00:10:00".parse().expect("parse");
        assert_eq!(wt.as_duration(), Duration::from_secs(600));
        assert_eq!(wt.to_string(), "00:10:00");

        let long: Walltime = "120:05:09".parse().expect("parse");
        assert_eq!(long.to_string(), "120:05:09");
    }

    #[test]
    fn walltime_rejects_malformed_values() {
        assert!("10:00".parse::<Walltime>().is_err());
        assert!("00:61:00".parse::<Walltime>().is_err());
        assert!("aa:00:00".parse::<Walltime>().is_err());
    }

    #[test]
    fn walltime_hours_are_capped() {
        assert!("3000000000000000:00:00".parse::<Walltime>().is_err());
        assert!("18446744073709551615:59:59".parse::<Walltime>().is_err());
        let max: Walltime = "100000:00:00".parse().expect("parse");
        assert_eq!(max, Walltime::MAX);
        assert!("100000:00:01".parse::<Walltime>().is_err());
        assert!("100001:00:00".parse::<Walltime>().is_err());
    }

    #[test]
    fn mem_size_normalizes_case() {
        let mem: MemSize = "32GB".parse().expect("parse");
        assert_eq!(mem.to_string(), "32gb");
        assert_eq!(mem.bytes(), 32 * (1 << 30));
        assert!("gb".parse::<MemSize>().is_err());
        assert!("32xb".parse::<MemSize>().is_err());
    }

    #[test]
    fn mail_flags_are_ordered_and_deduplicated() {
        let flags = mail_flags(&[MailEvent::End, MailEvent::Abort, MailEvent::Begin, MailEvent::End]);
        assert_eq!(flags, "abe");
        assert_eq!(mail_flags(&[]), "n");
    }

    #[test]
    fn default_select_spec() {
        assert_eq!(
            ResourceRequest::default().select_spec(),
            "select=1:ncpus=8:ngpus=4:mem=32gb:gpu_mem=32gb"
        );
    }
}
