//! Resource vectors and quota snapshots.
//!
//! A [`ResourceVector`] is a `{cpu, memory, gpu}` triple. Vectors form a
//! commutative monoid under addition with [`ResourceVector::ZERO`] as the
//! identity; subtraction clamps every component at zero. Comparison is the
//! component-wise partial order, so two vectors can be incomparable.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::quantity::{parse_bytes, parse_cpu, parse_count, BYTES_PER_MIB};

/// A bundle of compute resources.
///
/// `cpu` is in cores, `memory` in MiB, `gpu` in whole devices.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU cores (fractional cores allowed).
    pub cpu: f64,
    /// Memory in MiB.
    pub memory: f64,
    /// Whole GPU devices.
    pub gpu: u32,
}

impl ResourceVector {
    /// The empty vector; identity for addition.
    pub const ZERO: Self = Self {
        cpu: 0.0,
        memory: 0.0,
        gpu: 0,
    };

    /// Create a validated resource vector.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidResourceRequest`] if `cpu` or `memory` is
    /// negative, NaN or infinite.
    pub fn new(cpu: f64, memory: f64, gpu: u32) -> Result<Self> {
        let vector = Self { cpu, memory, gpu };
        vector.validate()?;
        Ok(vector)
    }

    /// Set CPU cores.
    #[must_use]
    pub const fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    /// Set memory in MiB.
    #[must_use]
    pub const fn with_memory(mut self, memory: f64) -> Self {
        self.memory = memory;
        self
    }

    /// Set GPU count.
    #[must_use]
    pub const fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = gpu;
        self
    }

    /// Validate that every component is finite and non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::InvalidResourceRequest`] naming the first bad
    /// component.
    pub fn validate(&self) -> Result<()> {
        validate_component("cpu", self.cpu)?;
        validate_component("memory", self.memory)
    }

    /// Check if every component is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory == 0.0 && self.gpu == 0
    }

    /// Component-wise difference, each component clamped at zero.
    #[must_use]
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Component-wise difference, `None` if any component would go negative.
    ///
    /// Used to detect over-release before falling back to the clamped value.
    #[must_use]
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        if other.fits_within(self) {
            Some(self.saturating_sub(other))
        } else {
            None
        }
    }

    /// `self ≤ other` in every component.
    #[must_use]
    pub fn fits_within(&self, other: &Self) -> bool {
        self.cpu <= other.cpu && self.memory <= other.memory && self.gpu <= other.gpu
    }

    /// Component-wise maximum.
    #[must_use]
    pub fn component_max(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            gpu: self.gpu.max(other.gpu),
        }
    }

    /// Per-resource `self / limits * 100`, zero where the limit is zero.
    #[must_use]
    pub fn usage_percentage(&self, limits: &Self) -> ResourceUsage {
        ResourceUsage {
            cpu: percent(self.cpu, limits.cpu),
            memory: percent(self.memory, limits.memory),
            gpu: percent(f64::from(self.gpu), f64::from(limits.gpu)),
        }
    }
}

fn validate_component(name: &str, value: f64) -> Result<()> {
    if value.is_nan() {
        return Err(ProtoError::InvalidResourceRequest(format!(
            "{name} cannot be NaN"
        )));
    }
    if value.is_infinite() {
        return Err(ProtoError::InvalidResourceRequest(format!(
            "{name} cannot be infinite"
        )));
    }
    if value < 0.0 {
        return Err(ProtoError::InvalidResourceRequest(format!(
            "{name} cannot be negative: {value}"
        )));
    }
    Ok(())
}

fn percent(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    (used / limit) * 100.0
}

impl PartialOrd for ResourceVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.fits_within(other), other.fits_within(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl Add for ResourceVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            gpu: self.gpu.saturating_add(rhs.gpu),
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(&rhs)
    }
}

impl Sum for ResourceVector {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a ResourceVector> for ResourceVector {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, v| acc + *v)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={},memory={}Mi,gpu={}",
            self.cpu, self.memory, self.gpu
        )
    }
}

impl FromStr for ResourceVector {
    type Err = ProtoError;

    /// Parse `cpu=4,memory=16Gi,gpu=1`.
    ///
    /// Missing keys default to zero. A bare memory number is MiB; suffixed
    /// values follow Kubernetes quantity rules.
    fn from_str(s: &str) -> Result<Self> {
        let mut cpu = None;
        let mut memory = None;
        let mut gpu = None;

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ProtoError::InvalidResourceRequest(format!("expected key=value, got '{part}'"))
            })?;
            let (key, value) = (key.trim(), value.trim());
            let slot_taken = match key {
                "cpu" | "cpus" => cpu.replace(parse_cpu(value)?).is_some(),
                "memory" | "mem" => memory.replace(parse_memory_mib(value)?).is_some(),
                "gpu" | "gpus" => gpu.replace(parse_count(value)?).is_some(),
                other => {
                    return Err(ProtoError::InvalidResourceRequest(format!(
                        "unknown resource '{other}'"
                    )));
                }
            };
            if slot_taken {
                return Err(ProtoError::InvalidResourceRequest(format!(
                    "resource '{key}' given more than once"
                )));
            }
        }

        Self::new(cpu.unwrap_or(0.0), memory.unwrap_or(0.0), gpu.unwrap_or(0))
    }
}

fn parse_memory_mib(value: &str) -> Result<f64> {
    if let Ok(mib) = value.parse::<f64>() {
        return Ok(mib);
    }
    Ok(parse_bytes(value)? / BYTES_PER_MIB)
}

/// Per-resource utilisation percentages.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilisation percentage.
    pub cpu: f64,
    /// Memory utilisation percentage.
    pub memory: f64,
    /// GPU utilisation percentage.
    pub gpu: f64,
}

impl ResourceUsage {
    /// Highest of the three percentages.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.cpu.max(self.memory).max(self.gpu)
    }
}

/// Capacity and usage of one scope at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Total capacity.
    pub limits: ResourceVector,
    /// Capacity currently in use (including local reservations).
    pub used: ResourceVector,
    /// When the data was observed.
    pub observed_at: DateTime<Utc>,
    /// Set when the backend could not be reached and this is the last known
    /// value.
    pub stale: bool,
}

impl QuotaSnapshot {
    /// Create a fresh snapshot observed now.
    #[must_use]
    pub fn new(limits: ResourceVector, used: ResourceVector) -> Self {
        Self {
            limits,
            used,
            observed_at: Utc::now(),
            stale: false,
        }
    }

    /// A snapshot with nothing in use.
    #[must_use]
    pub fn empty(limits: ResourceVector) -> Self {
        Self::new(limits, ResourceVector::ZERO)
    }

    /// Mark this snapshot as the last known value of an unreachable backend.
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    /// `limits − used`, clamped at zero.
    #[must_use]
    pub fn available(&self) -> ResourceVector {
        self.limits.saturating_sub(&self.used)
    }

    /// Check if `request` fits in what is still available.
    #[must_use]
    pub fn has_capacity(&self, request: &ResourceVector) -> bool {
        request.fits_within(&self.available())
    }

    /// Check the `used ≤ limits` invariant.
    #[must_use]
    pub fn is_within_limits(&self) -> bool {
        self.used.fits_within(&self.limits)
    }

    /// Per-resource `used / limits * 100`.
    #[must_use]
    pub fn usage_percentage(&self) -> ResourceUsage {
        self.used.usage_percentage(&self.limits)
    }

    /// How long ago the data was observed.
    #[must_use]
    pub fn age(&self) -> Duration {
        Utc::now() - self.observed_at
    }
}
