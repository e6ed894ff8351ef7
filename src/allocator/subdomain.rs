use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use tracing::info;

use crate::{
    error::{ConflictError, RequestError, RequestResult, ValidationError},
    machinery::store::{Store, WriteTxn},
    resources::subdomain::{RecordType, SubdomainRecord},
};

/// Sub-subdomains a user may hold below one top-level subdomain.
pub const MAX_SUB_SUBDOMAINS: usize = 2;

/// A subdomain that passed the ownership rules against some snapshot of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdomainClaim {
    pub zone: String,
    pub subdomain: String,
    pub top_level: String,
}

impl SubdomainClaim {
    pub fn is_top_level(&self) -> bool {
        self.subdomain == self.top_level
    }
}

pub struct SubdomainAllocator {
    store: Arc<Store>,
    suffix: String,
}

impl SubdomainAllocator {
    pub fn new(store: Arc<Store>, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into().trim_matches('.').to_lowercase();
        Self { store, suffix }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// `Blog.` becomes `blog.<suffix>`.
    pub fn normalize(&self, label: &str) -> Result<String, ValidationError> {
        let label = label.trim().trim_end_matches('.').to_lowercase();

        let valid = !label.is_empty()
            && label.split('.').all(|part| {
                !part.is_empty()
                    && !part.starts_with('-')
                    && !part.ends_with('-')
                    && part
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
        if !valid {
            return Err(ValidationError::InvalidSubdomain(label));
        }

        if self.suffix.is_empty() {
            Ok(label)
        } else {
            Ok(format!("{label}.{}", self.suffix))
        }
    }

    /// Checks a claim against the current snapshot without writing anything.
    pub fn claim_subdomain(
        &self,
        zone: &str,
        label: &str,
        user_id: &str,
        record_type: RecordType,
        value: &str,
    ) -> RequestResult<SubdomainClaim> {
        let claim = self.claim_for(zone, label)?;
        let zone_records = self.store.list(&SubdomainRecord::zone_key(&claim.zone))?;
        evaluate(&zone_records, &claim, user_id, record_type, value)?;
        Ok(claim)
    }

    /// Same as [`SubdomainAllocator::claim_subdomain`] against an open transaction.
    pub fn check_in(
        &self,
        txn: &WriteTxn<'_>,
        zone: &str,
        label: &str,
        user_id: &str,
        record_type: RecordType,
        value: &str,
    ) -> RequestResult<SubdomainClaim> {
        let claim = self.claim_for(zone, label)?;
        let zone_records = txn.list(&SubdomainRecord::zone_key(&claim.zone))?;
        evaluate(&zone_records, &claim, user_id, record_type, value)?;
        Ok(claim)
    }

    /// Re-runs the ownership rules and inserts the record in one write transaction, so
    /// two sibling claims racing for the last free slot cannot both commit.
    pub fn commit(
        &self,
        claim: &SubdomainClaim,
        record_type: RecordType,
        value: &str,
        vm_id: u64,
        user_id: &str,
    ) -> RequestResult<SubdomainRecord> {
        let record = SubdomainRecord {
            zone: claim.zone.clone(),
            subdomain: claim.subdomain.clone(),
            record_type,
            value: value.to_string(),
            vm_id,
            user_id: user_id.to_string(),
        };

        self.store.try_write(|txn| {
            let zone_records = txn.list(&SubdomainRecord::zone_key(&claim.zone))?;
            evaluate(&zone_records, claim, user_id, record_type, value)?;
            txn.put(&record.own_key(), &record)?;
            Ok::<_, RequestError>(())
        })?;

        info!(
            "claimed {} {} in zone {} for vm {}",
            record.record_type, record.subdomain, record.zone, vm_id
        );
        Ok(record)
    }

    pub fn remove(&self, record: &SubdomainRecord) -> Result<bool> {
        self.store.delete(&record.own_key())
    }

    pub fn records_for_vm(&self, vm_id: u64) -> Result<Vec<SubdomainRecord>> {
        let records = self.store.list(&SubdomainRecord::partial_key())?;
        Ok(records.into_iter().filter(|r| r.vm_id == vm_id).collect())
    }

    fn claim_for(&self, zone: &str, label: &str) -> Result<SubdomainClaim, ValidationError> {
        let zone = zone.trim().trim_end_matches('.').to_lowercase();
        if zone.is_empty() {
            return Err(ValidationError::InvalidSubdomain(label.to_string()));
        }

        let subdomain = self.normalize(label)?;
        let top_level = top_level_of(&subdomain, &self.suffix);

        Ok(SubdomainClaim {
            zone,
            subdomain,
            top_level,
        })
    }
}

/// Last two labels of `subdomain` ahead of `suffix`, with the suffix re-appended.
/// Names of one or two labels are their own top level.
pub fn top_level_of(subdomain: &str, suffix: &str) -> String {
    let label = if suffix.is_empty() {
        subdomain
    } else {
        subdomain
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(subdomain)
    };

    let parts: Vec<&str> = label.split('.').collect();
    if parts.len() <= 2 {
        return subdomain.to_string();
    }

    let top = parts[parts.len() - 2..].join(".");
    if suffix.is_empty() || label == subdomain {
        top
    } else {
        format!("{top}.{suffix}")
    }
}

fn is_below(subdomain: &str, top_level: &str) -> bool {
    subdomain == top_level
        || subdomain
            .strip_suffix(top_level)
            .is_some_and(|rest| rest.ends_with('.'))
}

fn evaluate(
    zone_records: &[SubdomainRecord],
    claim: &SubdomainClaim,
    user_id: &str,
    record_type: RecordType,
    value: &str,
) -> Result<(), ConflictError> {
    let held_by_others = zone_records
        .iter()
        .any(|r| r.user_id != user_id && is_below(&r.subdomain, &claim.top_level));

    if claim.is_top_level() {
        if held_by_others {
            return Err(ConflictError::OwnershipRequired {
                top_level: claim.top_level.clone(),
            });
        }
    } else {
        let owned = zone_records
            .iter()
            .any(|r| r.user_id == user_id && is_below(&r.subdomain, &claim.top_level));
        if !owned || held_by_others {
            return Err(ConflictError::OwnershipRequired {
                top_level: claim.top_level.clone(),
            });
        }
    }

    let exists = zone_records.iter().any(|r| {
        r.subdomain == claim.subdomain && r.record_type == record_type && r.value == value
    });
    if exists {
        return Err(ConflictError::AlreadyExists);
    }

    if !claim.is_top_level() {
        let siblings: BTreeSet<&str> = zone_records
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.subdomain.as_str())
            .filter(|s| *s != claim.top_level && is_below(s, &claim.top_level))
            .collect();

        if !siblings.contains(claim.subdomain.as_str()) && siblings.len() >= MAX_SUB_SUBDOMAINS {
            return Err(ConflictError::TooManySubSubdomains {
                top_level: claim.top_level.clone(),
                max: MAX_SUB_SUBDOMAINS,
            });
        }
    }

    Ok(())
}
