use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Actor;
#[cfg(test)]
use crate::model::{Appointment, AppointmentStatus};

/// One shared secret for every login. Identity comes from the user name,
/// see [`actor_from_login`].
#[derive(Debug)]
pub struct MedislotAuthSource {
    password: String,
}

impl MedislotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for MedislotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        actor_from_login(login.user())?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Map a login user name to the acting identity:
/// `admin`, `doctor_<ULID>`, `patient_<ULID>`. A `doctor_` or `patient_`
/// name whose id does not parse is refused. Any other name is a service
/// connection.
pub fn actor_from_login(user: Option<&str>) -> PgWireResult<Actor> {
    let Some(user) = user else {
        return Ok(Actor::service());
    };
    if user == "admin" {
        return Ok(Actor::admin());
    }
    let parse = |rest: &str| {
        Ulid::from_string(rest).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("login {user}: malformed id: {e}"),
            )))
        })
    };
    if let Some(rest) = user.strip_prefix("doctor_") {
        return parse(rest).map(Actor::doctor);
    }
    if let Some(rest) = user.strip_prefix("patient_") {
        return parse(rest).map(Actor::patient);
    }
    Ok(Actor::service())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn login_names_map_to_roles() {
        let id = Ulid::new();
        assert_eq!(actor_from_login(Some("admin")).unwrap(), Actor::admin());
        assert_eq!(
            actor_from_login(Some(&format!("doctor_{id}"))).unwrap(),
            Actor::doctor(id)
        );
        assert_eq!(
            actor_from_login(Some(&format!("patient_{id}"))).unwrap(),
            Actor::patient(id)
        );
    }

    #[test]
    fn unprefixed_logins_are_service() {
        for user in [None, Some("postgres"), Some("Admin"), Some("scheduler")] {
            let actor = actor_from_login(user).unwrap();
            assert_eq!(actor.role, Role::Service, "{user:?}");
            assert_eq!(actor.id, None);
        }
    }

    #[test]
    fn malformed_role_logins_are_refused() {
        for user in ["doctor_", "doctor_x", "patient_xyz", "patient_01J0000000000000000000000!"] {
            let err = actor_from_login(Some(user)).unwrap_err();
            let PgWireError::UserError(info) = err else {
                panic!("expected a user error for {user}");
            };
            assert_eq!(info.code, "28000", "{user}");
        }
    }

    #[test]
    fn service_reads_what_it_may_book() {
        let appointment = Appointment {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            patient_id: Ulid::new(),
            date: chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            time: "10:00".parse().unwrap(),
            duration_minutes: 30,
            notes: None,
            status: AppointmentStatus::Confirmed,
            rating: None,
            review: None,
            reminder_sent: false,
        };
        let service = actor_from_login(Some("scheduler")).unwrap();
        assert!(service.is_privileged());
        assert!(service.is_party_to(&appointment));
        assert!(!Actor::patient(Ulid::new()).is_party_to(&appointment));
    }
}
