mod admin;
mod notification;
mod server;
mod template;

pub use admin::AdminService;
pub use notification::NotificationService;
pub use server::{DnsService, ServerService};
pub use template::TemplateService;
