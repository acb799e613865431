use crate::model::*;
use crate::policy::AccessPolicy;

use super::EngineError;

/// Lifecycle operations applied to an existing booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    Reject,
    CancelByUser,
    CancelByAdmin,
    Delete,
    Pickup,
    Return,
}

enum Requirement {
    Administrative,
    Owner,
}

impl Transition {
    pub fn label(self) -> &'static str {
        match self {
            Transition::Confirm => "confirm",
            Transition::Reject => "reject",
            Transition::CancelByUser | Transition::CancelByAdmin => "cancel",
            Transition::Delete => "delete",
            Transition::Pickup => "pick up",
            Transition::Return => "return",
        }
    }

    fn requirement(self) -> Requirement {
        match self {
            Transition::CancelByUser => Requirement::Owner,
            Transition::Confirm
            | Transition::Reject
            | Transition::CancelByAdmin
            | Transition::Delete
            | Transition::Pickup
            | Transition::Return => Requirement::Administrative,
        }
    }
}

/// The status graph. Returns the status the booking ends up in.
///
/// Pickup and return are flags beside the status, so they keep it unchanged.
/// A return is accepted after pickup even if an admin has since cancelled or
/// deleted the booking: the stock is still out and has to come back.
pub fn next_status(booking: &Booking, transition: Transition) -> Result<BookingStatus, EngineError> {
    use BookingStatus::*;
    match (booking.status, transition) {
        (Pending, Transition::Confirm) => Ok(Confirmed),
        (Pending, Transition::Reject) => Ok(Rejected),
        (Pending, Transition::CancelByUser) => Ok(CancelledByUser),
        (Pending | Confirmed, Transition::CancelByAdmin) => Ok(CancelledByAdmin),
        (Pending | Confirmed, Transition::Delete) => Ok(Deleted),
        (Confirmed, Transition::Pickup) if !booking.picked_up => Ok(Confirmed),
        (status, Transition::Return) if booking.picked_up && !booking.returned => Ok(status),
        (Confirmed, Transition::Pickup) => Err(EngineError::Forbidden(format!(
            "booking {} is already picked up",
            booking.booking_number
        ))),
        (_, Transition::Return) if booking.returned => Err(EngineError::Forbidden(format!(
            "booking {} is already returned",
            booking.booking_number
        ))),
        (_, Transition::Return) => Err(EngineError::Forbidden(format!(
            "booking {} was never picked up",
            booking.booking_number
        ))),
        (status, t) => Err(EngineError::Forbidden(format!(
            "cannot {} a {status} booking",
            t.label()
        ))),
    }
}

/// Consult the access policy for the actor required by `transition`.
pub async fn authorize(
    policy: &dyn AccessPolicy,
    actor: &Actor,
    booking: &Booking,
    transition: Transition,
) -> Result<(), EngineError> {
    match transition.requirement() {
        Requirement::Administrative => {
            if policy.has_role(actor, Role::ADMINISTRATIVE).await {
                Ok(())
            } else {
                Err(EngineError::Unauthorized("administrative role required"))
            }
        }
        Requirement::Owner => {
            if policy.is_owner(actor, booking).await {
                Ok(())
            } else {
                Err(EngineError::Forbidden(format!(
                    "actor {} does not own booking {}",
                    actor.id, booking.booking_number
                )))
            }
        }
    }
}

/// Owner or administrator: who may read or edit a booking's line items.
pub async fn authorize_owner_or_admin(
    policy: &dyn AccessPolicy,
    actor: &Actor,
    booking: &Booking,
) -> Result<(), EngineError> {
    if policy.has_role(actor, Role::ADMINISTRATIVE).await || policy.is_owner(actor, booking).await {
        return Ok(());
    }
    if !policy.has_role(actor, Role::AUTHENTICATED).await {
        return Err(EngineError::Unauthorized("authentication required"));
    }
    Err(EngineError::Forbidden(format!(
        "actor {} does not own booking {}",
        actor.id, booking.booking_number
    )))
}
