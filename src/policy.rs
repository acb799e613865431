use async_trait::async_trait;

use crate::model::{Actor, Booking, Role};

/// Role and ownership decisions, supplied by the surrounding application.
///
/// The engine asks; it never decides on its own who an actor is. Implementations
/// may consult a session store or directory, hence async.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn has_role(&self, actor: &Actor, roles: &[Role]) -> bool;
    async fn is_owner(&self, actor: &Actor, booking: &Booking) -> bool;
}

/// Trusts the role already resolved on the [`Actor`] and compares owner ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RolePolicy;

#[async_trait]
impl AccessPolicy for RolePolicy {
    async fn has_role(&self, actor: &Actor, roles: &[Role]) -> bool {
        roles.contains(&actor.role)
    }

    async fn is_owner(&self, actor: &Actor, booking: &Booking) -> bool {
        actor.role != Role::Guest && booking.owner_id == actor.id
    }
}
