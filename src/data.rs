#[derive(Debug, Clone, Copy)]
pub enum Collections {
    VirtualMachine,
    IpLease,
    Subdomain,
    Notification,
    Sequence,
}

impl AsRef<str> for Collections {
    fn as_ref(&self) -> &str {
        match self {
            Collections::VirtualMachine => "virtual_machine",
            Collections::IpLease => "ip_lease",
            Collections::Subdomain => "subdomain",
            Collections::Notification => "notification",
            Collections::Sequence => "sequence",
        }
    }
}
