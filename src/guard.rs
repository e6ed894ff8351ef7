use std::net::Ipv4Addr;

use chrono::NaiveDate;

use crate::{
    error::{ConflictError, RequestResult, ValidationError},
    machinery::store::{Store, WriteTxn},
    resources::{
        identity::Identity,
        machine::{CreateServerRequest, SubdomainRequest, VirtualMachineRecord},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardLimits {
    /// Servers a non-admin user may own at once.
    pub server_limit: usize,
    pub max_storage_gib: u32,
    pub max_memory_gib: u32,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            server_limit: 2,
            max_storage_gib: 20,
            max_memory_gib: 2,
        }
    }
}

/// A create request that passed every side-effect free check.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub name: String,
    pub description: String,
    pub operating_system: String,
    pub end_date: NaiveDate,
    pub storage_gib: u32,
    pub memory_gib: u32,
    pub home_ips: Vec<Ipv4Addr>,
    pub subdomain: Option<SubdomainRequest>,
}

pub struct Guard {
    limits: GuardLimits,
}

impl Guard {
    pub fn new(limits: GuardLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &GuardLimits {
        &self.limits
    }

    pub fn validate(
        &self,
        request: &CreateServerRequest,
        templates: &[String],
        today: NaiveDate,
    ) -> Result<ServerSpec, ValidationError> {
        let name = normalize_name(&request.name);
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let end_date = NaiveDate::parse_from_str(request.end_date.trim(), "%Y-%m-%d")
            .map_err(|_| ValidationError::InvalidEndDate(request.end_date.clone()))?;
        if end_date <= today {
            return Err(ValidationError::EndDateInPast);
        }

        if !templates.iter().any(|t| t == &request.operating_system) {
            return Err(ValidationError::UnknownTemplate(
                request.operating_system.clone(),
            ));
        }

        if request.storage > self.limits.max_storage_gib {
            return Err(ValidationError::StorageTooLarge {
                requested: request.storage,
                max: self.limits.max_storage_gib,
            });
        }
        if request.memory > self.limits.max_memory_gib {
            return Err(ValidationError::MemoryTooLarge {
                requested: request.memory,
                max: self.limits.max_memory_gib,
            });
        }

        let mut home_ips = Vec::new();
        for ip in request.home_ips.iter().flatten() {
            let ip = ip.trim();
            if ip.is_empty() {
                continue;
            }
            let parsed: Ipv4Addr = ip
                .parse()
                .map_err(|_| ValidationError::InvalidHomeIp(ip.to_string()))?;
            if !home_ips.contains(&parsed) {
                home_ips.push(parsed);
            }
        }

        Ok(ServerSpec {
            name,
            description: request.description.clone(),
            operating_system: request.operating_system.clone(),
            end_date,
            storage_gib: request.storage,
            memory_gib: request.memory,
            home_ips,
            subdomain: request.subdomain(),
        })
    }

    /// Early rejection against a read snapshot. The authoritative check is
    /// [`Guard::check_in`], run again in the transaction that inserts the row.
    pub fn check(&self, store: &Store, identity: &Identity, name: &str) -> RequestResult<()> {
        let records = store.list(&VirtualMachineRecord::partial_key())?;
        Ok(self.evaluate(&records, identity, name)?)
    }

    pub fn check_in(
        &self,
        txn: &WriteTxn<'_>,
        identity: &Identity,
        name: &str,
    ) -> RequestResult<()> {
        let records = txn.list(&VirtualMachineRecord::partial_key())?;
        Ok(self.evaluate(&records, identity, name)?)
    }

    fn evaluate(
        &self,
        records: &[VirtualMachineRecord],
        identity: &Identity,
        name: &str,
    ) -> Result<(), ConflictError> {
        let owned: Vec<&VirtualMachineRecord> = records
            .iter()
            .filter(|r| r.user_id == identity.user_id)
            .collect();

        if owned.iter().any(|r| r.name == name) {
            return Err(ConflictError::NameConflict(name.to_string()));
        }

        if !identity.is_admin && owned.len() >= self.limits.server_limit {
            return Err(ConflictError::QuotaExceeded {
                limit: self.limits.server_limit,
            });
        }

        Ok(())
    }
}

/// Server names never contain whitespace.
pub fn normalize_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::RequestError;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
    }

    fn request(name: &str) -> CreateServerRequest {
        CreateServerRequest {
            name: name.to_string(),
            description: String::new(),
            operating_system: "UBUNTU".to_string(),
            end_date: "2030-01-02".to_string(),
            storage: 10,
            memory: 1,
            home_ips: Some(vec!["1.2.3.4".to_string(), " 1.2.3.4".to_string()]),
            sub_domain: None,
            domain_zone: None,
        }
    }

    fn identity(user_id: &str, is_admin: bool) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            is_admin,
            display_name: "Test User".to_string(),
            external_id: "s1".to_string(),
            email: None,
        }
    }

    fn record(id: u64, user_id: &str, name: &str) -> VirtualMachineRecord {
        VirtualMachineRecord {
            id,
            user_id: user_id.to_string(),
            external_id: "s1".to_string(),
            platform_id: None,
            name: name.to_string(),
            description: String::new(),
            end_date: today(),
            operating_system: "UBUNTU".to_string(),
            storage_gib: 10,
            memory_gib: 1,
            ip: None,
        }
    }

    #[test]
    fn test_validate() {
        let guard = Guard::new(GuardLimits::default());
        let templates = vec!["UBUNTU".to_string()];

        let spec = guard
            .validate(&request("web 1"), &templates, today())
            .unwrap();
        assert_eq!(spec.name, "web1");
        assert_eq!(spec.home_ips, vec![Ipv4Addr::new(1, 2, 3, 4)]);

        let mut bad = request("web1");
        bad.end_date = "2030-01-01".to_string();
        assert_eq!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::EndDateInPast)
        );

        bad.end_date = "01/02/2030".to_string();
        assert!(matches!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::InvalidEndDate(_))
        ));

        let mut bad = request("web1");
        bad.operating_system = "WINDOWS".to_string();
        assert!(matches!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::UnknownTemplate(_))
        ));

        let mut bad = request("web1");
        bad.storage = 21;
        assert!(matches!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::StorageTooLarge { .. })
        ));

        let mut bad = request("web1");
        bad.memory = 3;
        assert!(matches!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::MemoryTooLarge { .. })
        ));

        let mut bad = request("web1");
        bad.home_ips = Some(vec!["not-an-ip".to_string()]);
        assert!(matches!(
            guard.validate(&bad, &templates, today()),
            Err(ValidationError::InvalidHomeIp(_))
        ));

        assert_eq!(
            guard.validate(&request("   "), &templates, today()),
            Err(ValidationError::EmptyName)
        );
    }

    #[tokio::test]
    async fn test_name_conflict_and_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let guard = Guard::new(GuardLimits::default());

        store
            .put(&VirtualMachineRecord::key(1), &record(1, "alice", "web1"))
            .unwrap();

        let alice = identity("alice", false);
        assert!(matches!(
            guard.check(&store, &alice, "web1"),
            Err(RequestError::Conflict(ConflictError::NameConflict(_)))
        ));
        guard.check(&store, &alice, "web2").unwrap();
        // names are per user
        guard.check(&store, &identity("bob", false), "web1").unwrap();

        store
            .put(&VirtualMachineRecord::key(2), &record(2, "alice", "web2"))
            .unwrap();
        assert!(matches!(
            guard.check(&store, &alice, "web3"),
            Err(RequestError::Conflict(ConflictError::QuotaExceeded { limit: 2 }))
        ));

        guard.check(&store, &identity("alice", true), "web3").unwrap();
    }
}
