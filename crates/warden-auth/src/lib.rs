pub mod audit;
pub mod authenticator;
pub mod cache;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod lock;
pub mod password;
pub mod permissions;
pub mod store;
pub mod tenant;
pub mod throttle;
pub mod token;
pub mod types;

pub use audit::{AuditRecorder, AuditSink, AuditWorker, StoreAuditSink};
pub use authenticator::{AuthContext, TokenAuthenticator};
pub use cache::{CacheVersions, ReadCache};
pub use config::AuthConfig;
pub use error::{AuthError, ErrorCode};
pub use idempotency::{Begin, IdempotencyCoordinator, IdempotentRequest, Outcome};
pub use lock::{LockInput, OptimisticLock, Versioned};
pub use password::{hash_password, verify_password};
pub use permissions::{PERMISSIONS, PermissionSet, can_manage, ensure_can_manage};
pub use store::{AuthStore, SqliteAuthStore};
pub use tenant::{RoleScope, TenantContext, TenantContextResolver, TenantOption};
pub use throttle::LoginThrottle;
pub use token::{bearer_token, generate_api_token, hash_token};
pub use types::*;
