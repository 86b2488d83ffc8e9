use crate::access::{authorize, Operation, Stakeholders};
use crate::auth;
use crate::error::{Error, Result, Validator};
use crate::integrity;
use crate::models::{Id, NewUser, PublicUser, User, UserRole, UserUpdate};
use crate::storage::{fail, normalize_email};

use super::Registry;

const MIN_PASSWORD_LEN: usize = 8;

fn check_email(v: &mut Validator, email: &str) {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    v.check(valid, "email", "must be a valid email address");
    v.max_len(email, 254, "email");
}

fn check_password(v: &mut Validator, password: &str) {
    v.check(
        password.chars().count() >= MIN_PASSWORD_LEN,
        "password",
        format!("must be at least {} characters", MIN_PASSWORD_LEN),
    );
}

/// E.164-ish: optional `+`, then 2 to 15 digits not starting with 0
fn check_phone(v: &mut Validator, phone: Option<&str>) {
    if let Some(phone) = phone {
        let digits = phone.strip_prefix('+').unwrap_or(phone);
        let valid = (2..=15).contains(&digits.len())
            && digits.chars().all(|c| c.is_ascii_digit())
            && !digits.starts_with('0');
        v.check(valid, "phone", "must be an international phone number");
    }
}

fn check_full_name(v: &mut Validator, name: Option<&str>) {
    if let Some(name) = name {
        v.not_blank(name, "full_name").max_len(name, 100, "full_name");
    }
}

impl Registry {
    /// Self-service registration. Admin accounts are only created by admins.
    #[tracing::instrument(skip(self, input), fields(email = %input.email, role = %input.role))]
    pub fn register_user(&self, input: NewUser) -> Result<PublicUser> {
        if input.role == UserRole::Admin {
            return Err(Error::Forbidden(
                "admin accounts cannot be self-registered".to_string(),
            ));
        }
        self.insert_user(input)
    }

    /// Create a user with any role on behalf of an admin
    #[tracing::instrument(skip(self, actor, input), fields(actor = actor.id, role = %input.role))]
    pub fn create_user(&self, actor: &User, input: NewUser) -> Result<PublicUser> {
        authorize(actor, Operation::ChangeRole, &Stakeholders::default())?;
        self.insert_user(input)
    }

    /// First admin account, created offline through the CLI
    #[tracing::instrument(skip(self, password))]
    pub fn bootstrap_admin(&self, email: &str, password: &str) -> Result<User> {
        let created = self.insert_user(NewUser {
            email: email.to_string(),
            password: password.to_string(),
            full_name: None,
            phone: None,
            role: UserRole::Admin,
        })?;
        self.storage.fetch(created.id)
    }

    fn insert_user(&self, input: NewUser) -> Result<PublicUser> {
        let mut v = Validator::new();
        check_email(&mut v, &input.email);
        check_password(&mut v, &input.password);
        check_full_name(&mut v, input.full_name.as_deref());
        check_phone(&mut v, input.phone.as_deref());
        v.finish()?;

        let hashed_password = auth::hash_password(&input.password, self.policy.bcrypt_cost)
            .map_err(|e| Error::invalid("password", e.to_string()))?;
        let user = User {
            id: self.storage.next_id()?,
            email: normalize_email(&input.email),
            hashed_password,
            full_name: input.full_name,
            phone: input.phone,
            role: input.role,
            is_active: true,
        };

        self.storage.transaction(|tx| {
            tx.claim_email(&user.email, user.id)?;
            tx.put(&user)
        })?;
        tracing::info!(user_id = user.id, "user registered");
        Ok(user.into())
    }

    /// Verify credentials; `None` on any mismatch so callers cannot tell which emails exist
    #[tracing::instrument(skip(self, password))]
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.storage.user_by_email(email)? else {
            return Ok(None);
        };
        if !user.is_active {
            tracing::warn!(user_id = user.id, "login attempt on deactivated account");
            return Ok(None);
        }
        if auth::verify_password(password, &user.hashed_password).unwrap_or(false) {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    pub fn get_user(&self, actor: &User, id: Id) -> Result<PublicUser> {
        authorize(actor, Operation::ViewUser, &Stakeholders::user(id))?;
        Ok(self.storage.fetch::<User>(id)?.into())
    }

    pub fn list_users(&self, actor: &User) -> Result<Vec<PublicUser>> {
        authorize(actor, Operation::ChangeRole, &Stakeholders::default())?;
        Ok(self
            .storage
            .scan::<User>()?
            .into_iter()
            .map(PublicUser::from)
            .collect())
    }

    #[tracing::instrument(skip(self, actor, patch), fields(actor = actor.id))]
    pub fn update_user(&self, actor: &User, id: Id, patch: UserUpdate) -> Result<PublicUser> {
        let who = Stakeholders::user(id);
        authorize(actor, Operation::UpdateUser, &who)?;
        if patch.role.is_some() || patch.is_active.is_some() {
            authorize(actor, Operation::ChangeRole, &who)?;
        }

        let mut v = Validator::new();
        if let Some(email) = &patch.email {
            check_email(&mut v, email);
        }
        if let Some(password) = &patch.password {
            check_password(&mut v, password);
        }
        check_full_name(&mut v, patch.full_name.as_deref());
        check_phone(&mut v, patch.phone.as_deref());
        v.finish()?;

        // hashed outside the transaction body, which sled may re-run
        let new_hash = match &patch.password {
            Some(p) => Some(
                auth::hash_password(p, self.policy.bcrypt_cost)
                    .map_err(|e| Error::invalid("password", e.to_string()))?,
            ),
            None => None,
        };

        let updated = self.storage.transaction(|tx| {
            let mut user: User = tx.fetch(id)?;
            if let Some(email) = &patch.email {
                let email = normalize_email(email);
                if email != user.email {
                    tx.claim_email(&email, id)?;
                    tx.release_email(&user.email)?;
                    user.email = email;
                }
            }
            if let Some(hash) = &new_hash {
                user.hashed_password = hash.clone();
            }
            if let Some(name) = &patch.full_name {
                user.full_name = Some(name.clone());
            }
            if let Some(phone) = &patch.phone {
                user.phone = Some(phone.clone());
            }
            if let Some(role) = patch.role {
                user.role = role;
            }
            if let Some(active) = patch.is_active {
                if !active && id == actor.id {
                    return fail(Error::conflict("an admin cannot deactivate their own account"));
                }
                user.is_active = active;
            }
            tx.put(&user)?;
            Ok(user)
        })?;
        tracing::info!(user_id = id, "user updated");
        Ok(updated.into())
    }

    /// Delete a user with no remaining dependents; see [`integrity::delete_user`]
    #[tracing::instrument(skip(self, actor), fields(actor = actor.id))]
    pub fn delete_user(&self, actor: &User, id: Id) -> Result<()> {
        authorize(actor, Operation::DeleteUser, &Stakeholders::user(id))?;
        if id == actor.id {
            return Err(Error::conflict("users cannot delete their own account"));
        }
        let today = self.today();
        self.storage.transaction(|tx| {
            let user: User = tx.fetch(id)?;
            integrity::delete_user(tx, &user, today)
        })?;
        tracing::info!(user_id = id, "user deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::models::{MaintenanceType, NewMaintenanceRequest, NewUser, UserRole, UserUpdate};
    use crate::registry::testing::{date, Fixture};

    #[test]
    fn test_register_and_authenticate() {
        let fx = Fixture::new(date(2024, 3, 1));
        let owner = fx
            .registry
            .register_user(NewUser {
                email: "  Marie@Example.com ".into(),
                password: "correct horse".into(),
                full_name: Some("Marie Curie".into()),
                phone: Some("+33612345678".into()),
                role: UserRole::Owner,
            })
            .unwrap();
        assert_eq!(owner.email, "marie@example.com");

        let found = fx.registry.authenticate("MARIE@example.com", "correct horse").unwrap();
        assert_eq!(found.map(|u| u.id), Some(owner.id));
        assert!(fx.registry.authenticate("marie@example.com", "wrong").unwrap().is_none());
        assert!(fx.registry.authenticate("nobody@example.com", "x").unwrap().is_none());
    }

    #[test]
    fn test_register_rejects_bad_input_all_at_once() {
        let fx = Fixture::new(date(2024, 3, 1));
        let err = fx
            .registry
            .register_user(NewUser {
                email: "not-an-email".into(),
                password: "short".into(),
                full_name: None,
                phone: Some("0612".into()),
                role: UserRole::Tenant,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.fields(), vec!["email", "password", "phone"]);
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let fx = Fixture::new(date(2024, 3, 1));
        fx.user("dup@example.com", UserRole::Tenant);
        let err = fx
            .registry
            .register_user(NewUser {
                email: "DUP@example.com".into(),
                password: "password123".into(),
                full_name: None,
                phone: None,
                role: UserRole::Owner,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.fields(), vec!["email"]);
    }

    #[test]
    fn test_self_registration_cannot_create_admin() {
        let fx = Fixture::new(date(2024, 3, 1));
        let err = fx
            .registry
            .register_user(NewUser {
                email: "root@example.com".into(),
                password: "password123".into(),
                full_name: None,
                phone: None,
                role: UserRole::Admin,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_only_admin_changes_roles() {
        let fx = Fixture::new(date(2024, 3, 1));
        let tenant = fx.user("t@example.com", UserRole::Tenant);
        let promote = UserUpdate {
            role: Some(UserRole::Agent),
            ..Default::default()
        };
        let err = fx.registry.update_user(&tenant, tenant.id, promote.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let updated = fx.registry.update_user(&fx.admin, tenant.id, promote).unwrap();
        assert_eq!(updated.role, UserRole::Agent);

        // self-service profile edits are fine
        let renamed = fx
            .registry
            .update_user(
                &tenant,
                tenant.id,
                UserUpdate {
                    full_name: Some("Tess".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.full_name.as_deref(), Some("Tess"));
    }

    #[test]
    fn test_email_change_moves_unique_index() {
        let fx = Fixture::new(date(2024, 3, 1));
        let a = fx.user("a@example.com", UserRole::Owner);
        fx.user("b@example.com", UserRole::Owner);

        let taken = UserUpdate {
            email: Some("b@example.com".into()),
            ..Default::default()
        };
        assert_eq!(
            fx.registry.update_user(&a, a.id, taken).unwrap_err().kind(),
            ErrorKind::Conflict
        );

        let moved = UserUpdate {
            email: Some("a2@example.com".into()),
            ..Default::default()
        };
        fx.registry.update_user(&a, a.id, moved).unwrap();
        assert!(fx.registry.storage().user_by_email("a@example.com").unwrap().is_none());
        assert_eq!(
            fx.registry.storage().user_by_email("a2@example.com").unwrap().map(|u| u.id),
            Some(a.id)
        );
    }

    #[test]
    fn test_delete_user_restricted_by_dependents() {
        let fx = Fixture::new(date(2024, 3, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        let fixer = fx.user("fix@example.com", UserRole::Agent);
        let property = fx.property(&owner);

        let err = fx.registry.delete_user(&fx.admin, owner.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let request = fx
            .registry
            .create_maintenance_request(
                &fx.admin,
                NewMaintenanceRequest {
                    title: "Leaking tap".into(),
                    description: "Kitchen tap drips".into(),
                    kind: MaintenanceType::Repair,
                    priority: 2,
                    request_date: None,
                    notes: None,
                    property_id: property.id,
                    requested_by_id: None,
                    assigned_to_id: Some(fixer.id),
                },
            )
            .unwrap();

        // assignees are detached, not blocking
        fx.registry.delete_user(&fx.admin, fixer.id).unwrap();
        let request = fx.registry.get_maintenance_request(&fx.admin, request.id).unwrap();
        assert_eq!(request.assigned_to_id, None);
        assert!(fx.registry.authenticate("fix@example.com", "password123").unwrap().is_none());
    }

    #[test]
    fn test_deactivated_user_cannot_log_in_or_act() {
        let fx = Fixture::new(date(2024, 3, 1));
        let owner = fx.user("o@example.com", UserRole::Owner);
        fx.registry
            .update_user(
                &fx.admin,
                owner.id,
                UserUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(fx.registry.authenticate("o@example.com", "password123").unwrap().is_none());
        let stale = fx.registry.storage().fetch(owner.id).unwrap();
        let err = fx.registry.get_user(&stale, owner.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
