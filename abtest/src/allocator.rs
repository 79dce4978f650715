//! Proportional traffic rebalancing
//!
//! Every operation works on a scratch copy of the shares and only writes it
//! back once the result is known to be valid, so a rejected operation leaves
//! the allocator untouched.

use bazaar_config::AllocatorConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::version::{sample_versions, TestVersion, VersionStatus};
use crate::AllocationError;

const TOTAL: u32 = 100;

/// Versions of one A/B test and their traffic shares
#[derive(Debug, Clone)]
pub struct TrafficAllocator {
    limits: AllocatorConfig,
    versions: Vec<TestVersion>,
}

impl TrafficAllocator {
    /// Build from an existing set of versions, rejecting a set that breaks
    /// the allocation invariants
    pub fn new(limits: AllocatorConfig, versions: Vec<TestVersion>) -> Result<Self, AllocationError> {
        let allocator = Self { limits, versions };
        allocator.check_invariants()?;
        Ok(allocator)
    }

    /// Allocator seeded with the panel's sample versions, checked against
    /// `limits` like any other starting set
    pub fn with_sample_data(limits: AllocatorConfig) -> Result<Self, AllocationError> {
        Self::new(limits, sample_versions())
    }

    pub fn versions(&self) -> &[TestVersion] {
        &self.versions
    }

    pub fn version(&self, id: Uuid) -> Option<&TestVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn control(&self) -> Option<&TestVersion> {
        self.versions.iter().find(|v| v.is_control)
    }

    pub fn limits(&self) -> &AllocatorConfig {
        &self.limits
    }

    /// Give `id` a new share and scale every other version so the total
    /// stays at 100.
    ///
    /// The requested share is clamped to the configured bounds. Others keep
    /// their relative weights; the rounding remainder lands on the last
    /// non-target version. Returns the share actually applied.
    pub fn set_allocation(&mut self, id: Uuid, percent: u32) -> Result<u32, AllocationError> {
        let target = self.index_of(id).map_err(|e| self.rejected("set_allocation", e))?;
        let upper = self.limits.max_allocation.min(TOTAL);
        let percent = percent.clamp(self.limits.min_allocation.min(upper), upper);
        let remaining = TOTAL - percent;

        let others: Vec<usize> = (0..self.versions.len()).filter(|&i| i != target).collect();
        let mut shares = self.shares();
        shares[target] = percent;

        let weight: u32 = others.iter().map(|&i| shares[i]).sum();
        if weight == 0 {
            let each = remaining / others.len().max(1) as u32;
            for &i in &others {
                shares[i] = each;
            }
        } else {
            for &i in &others {
                shares[i] = scale(shares[i], remaining, weight);
            }
        }

        let order: Vec<usize> = others.iter().rev().copied().collect();
        settle(&mut shares, &order);

        self.commit(shares);
        self.record("set_allocation");
        debug!("Version {} now gets {}% of traffic", id, percent);
        Ok(percent)
    }

    /// Add an inactive version. Existing versions are reset to an equal
    /// share and the new one takes whatever is left over.
    pub fn add_version(&mut self, name: impl Into<String>) -> Result<Uuid, AllocationError> {
        let count = self.versions.len();
        if count >= self.limits.max_versions {
            return Err(self.rejected(
                "add_version",
                AllocationError::TooManyVersions {
                    max: self.limits.max_versions,
                },
            ));
        }

        let each = TOTAL / (count as u32 + 1);
        for version in &mut self.versions {
            version.traffic_allocation = each;
        }

        let version = TestVersion::new(name, TOTAL - each * count as u32);
        let id = version.id;
        info!("Added test version {} ({})", version.name, id);
        self.versions.push(version);

        self.record("add_version");
        Ok(id)
    }

    /// Remove a non-control version and hand its share to the rest in
    /// proportion to what they already have. The rounding remainder lands
    /// on the first remaining version.
    pub fn remove_version(&mut self, id: Uuid) -> Result<TestVersion, AllocationError> {
        let target = self.index_of(id).map_err(|e| self.rejected("remove_version", e))?;

        if self.versions[target].is_control {
            return Err(self.rejected("remove_version", AllocationError::ControlProtected));
        }
        if self.versions.len() <= self.limits.min_versions {
            return Err(self.rejected(
                "remove_version",
                AllocationError::TooFewVersions {
                    min: self.limits.min_versions,
                },
            ));
        }

        let mut shares = self.shares();
        let freed = shares.remove(target);
        let weight: u32 = shares.iter().sum();

        if weight == 0 {
            let each = TOTAL / shares.len() as u32;
            shares.iter_mut().for_each(|s| *s = each);
        } else {
            for share in shares.iter_mut() {
                *share += scale(*share, freed, weight);
            }
        }

        let order: Vec<usize> = (0..shares.len()).collect();
        settle(&mut shares, &order);

        let removed = self.versions.remove(target);
        self.commit(shares);

        self.record("remove_version");
        info!("Removed test version {} ({})", removed.name, removed.id);
        Ok(removed)
    }

    /// Activate or deactivate a version. The control always stays active.
    pub fn set_status(&mut self, id: Uuid, status: VersionStatus) -> Result<(), AllocationError> {
        let target = self.index_of(id).map_err(|e| self.rejected("set_status", e))?;

        if self.versions[target].is_control && status == VersionStatus::Inactive {
            return Err(self.rejected("set_status", AllocationError::ControlProtected));
        }

        self.versions[target].status = status;
        self.record("set_status");
        Ok(())
    }

    /// Sum is 100, count within bounds, exactly one control and it is active
    pub fn check_invariants(&self) -> Result<(), AllocationError> {
        let count = self.versions.len();
        if count < self.limits.min_versions || count > self.limits.max_versions {
            return Err(AllocationError::InvalidSetup(format!(
                "{} versions, expected {} to {}",
                count, self.limits.min_versions, self.limits.max_versions
            )));
        }

        let total: u32 = self.versions.iter().map(|v| v.traffic_allocation).sum();
        if total != TOTAL {
            return Err(AllocationError::InvalidSetup(format!(
                "traffic adds up to {}%",
                total
            )));
        }

        let controls: Vec<&TestVersion> = self.versions.iter().filter(|v| v.is_control).collect();
        match controls.as_slice() {
            [control] if control.is_active() => Ok(()),
            [_] => Err(AllocationError::InvalidSetup("control version is inactive".to_string())),
            _ => Err(AllocationError::InvalidSetup(format!(
                "{} control versions, expected 1",
                controls.len()
            ))),
        }
    }

    /// Version with the best conversion rate among those that saw traffic
    pub fn leading_version(&self) -> Option<&TestVersion> {
        self.versions
            .iter()
            .filter(|v| v.metrics.requests > 0)
            .max_by(|a, b| {
                a.metrics
                    .conversion_rate()
                    .total_cmp(&b.metrics.conversion_rate())
            })
    }

    /// Conversion-rate difference against the control, in percentage points
    pub fn lift_over_control(&self, id: Uuid) -> Option<f64> {
        let control = self.control()?;
        let version = self.version(id)?;
        Some(version.metrics.conversion_rate() - control.metrics.conversion_rate())
    }

    fn index_of(&self, id: Uuid) -> Result<usize, AllocationError> {
        self.versions
            .iter()
            .position(|v| v.id == id)
            .ok_or(AllocationError::UnknownVersion(id))
    }

    fn shares(&self) -> Vec<u32> {
        self.versions.iter().map(|v| v.traffic_allocation).collect()
    }

    fn commit(&mut self, shares: Vec<u32>) {
        for (version, share) in self.versions.iter_mut().zip(shares) {
            version.traffic_allocation = share;
        }
    }

    fn record(&self, operation: &str) {
        bazaar_metrics::metrics()
            .allocator
            .operations
            .with_label_values(&[operation])
            .inc();
    }

    fn rejected(&self, operation: &str, error: AllocationError) -> AllocationError {
        bazaar_metrics::metrics()
            .allocator
            .rejections
            .with_label_values(&[operation, error.reason()])
            .inc();
        debug!("{} rejected: {}", operation, error);
        error
    }
}

/// `share * numerator / denominator`, rounded half up
fn scale(share: u32, numerator: u32, denominator: u32) -> u32 {
    let (share, numerator, denominator) = (share as u64, numerator as u64, denominator as u64);
    ((2 * share * numerator + denominator) / (2 * denominator)) as u32
}

/// Bring the total back to 100, starting with `order[0]`. A share never
/// drops below zero; whatever it cannot give up moves on to the next index.
fn settle(shares: &mut [u32], order: &[usize]) {
    let mut diff = TOTAL as i64 - shares.iter().map(|&s| s as i64).sum::<i64>();

    for &i in order {
        if diff == 0 {
            break;
        }
        let current = shares[i] as i64;
        let adjusted = (current + diff).max(0);
        diff -= adjusted - current;
        shares[i] = adjusted as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(shares: &[u32]) -> TrafficAllocator {
        let versions = shares
            .iter()
            .enumerate()
            .map(|(i, &share)| {
                if i == 0 {
                    TestVersion::control("Control", share)
                } else {
                    TestVersion::new(format!("Variant {}", i), share).activated()
                }
            })
            .collect();
        TrafficAllocator::new(AllocatorConfig::default(), versions).unwrap()
    }

    fn shares(a: &TrafficAllocator) -> Vec<u32> {
        a.versions().iter().map(|v| v.traffic_allocation).collect()
    }

    #[test]
    fn test_set_allocation_on_control() {
        let mut a = allocator(&[33, 33, 34]);
        let control = a.control().unwrap().id;

        assert_eq!(a.set_allocation(control, 50).unwrap(), 50);
        let s = shares(&a);
        assert_eq!(s[0], 50);
        assert_eq!(s[1] + s[2], 50);
        assert_eq!(s, vec![50, 25, 25]);
    }

    #[test]
    fn test_set_allocation_clamps() {
        let mut a = allocator(&[50, 50]);
        let variant = a.versions()[1].id;

        assert_eq!(a.set_allocation(variant, 100).unwrap(), 90);
        assert_eq!(shares(&a), vec![10, 90]);

        assert_eq!(a.set_allocation(variant, 0).unwrap(), 10);
        assert_eq!(shares(&a), vec![90, 10]);
    }

    #[test]
    fn test_set_allocation_keeps_ratio() {
        let mut a = allocator(&[40, 40, 20]);
        let control = a.control().unwrap().id;

        a.set_allocation(control, 70).unwrap();
        assert_eq!(shares(&a), vec![70, 20, 10]);
    }

    #[test]
    fn test_set_allocation_remainder_goes_last() {
        let mut a = allocator(&[25, 25, 25, 25]);
        let control = a.control().unwrap().id;

        // 3 x 26.67 rounds to 27 each; the extra point comes off the last one
        a.set_allocation(control, 20).unwrap();
        assert_eq!(shares(&a), vec![20, 27, 27, 26]);
    }

    #[test]
    fn test_set_allocation_zero_weights_split_evenly() {
        let versions = vec![
            TestVersion::control("Control", 100),
            TestVersion::new("A", 0),
            TestVersion::new("B", 0),
        ];
        let mut a = TrafficAllocator::new(AllocatorConfig::default(), versions).unwrap();
        let control = a.control().unwrap().id;

        a.set_allocation(control, 55).unwrap();
        assert_eq!(shares(&a), vec![55, 22, 23]);
    }

    #[test]
    fn test_add_version_equal_split() {
        let mut a = allocator(&[50, 50]);
        let id = a.add_version("Variant B").unwrap();

        assert_eq!(shares(&a), vec![33, 33, 34]);
        let added = a.version(id).unwrap();
        assert_eq!(added.status, VersionStatus::Inactive);
        assert!(!added.is_control);
    }

    #[test]
    fn test_add_version_rejected_at_max() {
        let mut a = allocator(&[20, 20, 20, 20, 20]);
        let before = shares(&a);

        assert_eq!(
            a.add_version("Too many"),
            Err(AllocationError::TooManyVersions { max: 5 })
        );
        assert_eq!(shares(&a), before);
        assert_eq!(a.versions().len(), 5);
    }

    #[test]
    fn test_remove_version_proportional() {
        let mut a = allocator(&[50, 30, 20]);
        let last = a.versions()[2].id;

        let removed = a.remove_version(last).unwrap();
        assert_eq!(removed.traffic_allocation, 20);
        // 50 + 12.5 and 30 + 7.5 round to 63 and 38; the first gives one back
        assert_eq!(shares(&a), vec![62, 38]);
    }

    #[test]
    fn test_remove_refused_at_two_versions() {
        let mut a = allocator(&[50, 50]);
        let variant = a.versions()[1].id;

        let err = a.remove_version(variant).unwrap_err();
        assert_eq!(err, AllocationError::TooFewVersions { min: 2 });
        assert_eq!(shares(&a), vec![50, 50]);
        assert_eq!(a.versions().len(), 2);
    }

    #[test]
    fn test_remove_control_refused() {
        let mut a = allocator(&[25, 25, 25, 25]);
        let control = a.control().unwrap().id;

        assert_eq!(a.remove_version(control), Err(AllocationError::ControlProtected));
        assert_eq!(a.versions().len(), 4);

        let mut small = allocator(&[50, 50]);
        let control = small.control().unwrap().id;
        assert_eq!(small.remove_version(control), Err(AllocationError::ControlProtected));
    }

    #[test]
    fn test_control_cannot_be_deactivated() {
        let mut a = allocator(&[50, 50]);
        let control = a.control().unwrap().id;
        let variant = a.versions()[1].id;

        assert_eq!(
            a.set_status(control, VersionStatus::Inactive),
            Err(AllocationError::ControlProtected)
        );
        assert!(a.control().unwrap().is_active());

        a.set_status(variant, VersionStatus::Inactive).unwrap();
        assert!(!a.version(variant).unwrap().is_active());
    }

    #[test]
    fn test_unknown_version() {
        let mut a = allocator(&[50, 50]);
        let missing = Uuid::new_v4();
        assert_eq!(a.set_allocation(missing, 40), Err(AllocationError::UnknownVersion(missing)));
    }

    #[test]
    fn test_new_rejects_broken_setup() {
        let versions = vec![TestVersion::control("Control", 60), TestVersion::new("A", 30)];
        assert!(matches!(
            TrafficAllocator::new(AllocatorConfig::default(), versions),
            Err(AllocationError::InvalidSetup(_))
        ));

        let versions = vec![TestVersion::new("A", 50), TestVersion::new("B", 50)];
        assert!(TrafficAllocator::new(AllocatorConfig::default(), versions).is_err());
    }

    #[test]
    fn test_settle_never_goes_negative() {
        let mut shares = vec![40, 0, 1, 61];
        settle(&mut shares, &[1, 2, 3]);
        assert_eq!(shares, vec![40, 0, 0, 60]);
    }

    #[test]
    fn test_sample_data_respects_limits() {
        let a = TrafficAllocator::with_sample_data(AllocatorConfig::default()).unwrap();
        assert!(a.check_invariants().is_ok());

        let strict = AllocatorConfig {
            min_versions: 3,
            ..AllocatorConfig::default()
        };
        assert!(matches!(
            TrafficAllocator::with_sample_data(strict),
            Err(AllocationError::InvalidSetup(_))
        ));
    }

    #[test]
    fn test_leading_version() {
        let a = TrafficAllocator::with_sample_data(AllocatorConfig::default()).unwrap();
        let leader = a.leading_version().unwrap();
        assert_eq!(leader.name, "Variant A");

        let lift = a.lift_over_control(leader.id).unwrap();
        assert!(lift > 0.0);
    }
}
