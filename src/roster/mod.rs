pub mod auth;
pub mod cache;
pub mod gateway;
pub mod types;

pub use auth::RosterAuth;
pub use cache::{ChangeCache, MemoryCache, ProfileCache};
pub use gateway::{RosterApi, RosterGateway, RosterOptions};
pub use types::{AttendanceStatus, ChangeKind, DismissalChange, MarkResult, Member, MemberProfile};
