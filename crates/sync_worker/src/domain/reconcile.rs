//! Decides how an observed user changes the stored record.
//!
//! Versioned records keep, per attribute group, the latest observation and the
//! value it replaced. Flat records are overwritten field by field.

use chrono::Utc;
use common::domain::{MetaUser, User, ValueSnapshot, Versioned};
use std::mem;
use tracing::warn;

/// The write a reconciliation calls for
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation<T> {
    /// Nothing stored yet
    Insert(T),
    /// The stored record changed; write back the merged record
    Update(T),
    /// The observation carries nothing new
    Unchanged,
}

impl<T> Reconciliation<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Default a missing `updated_at` to now. The source should always supply it.
pub fn ensure_updated_at(mut user: User) -> User {
    if user.updated_at.is_none() {
        warn!(user_id = %user.id, "observed user has no updatedAt, using current time");
        user.updated_at = Some(Utc::now());
    }
    user
}

pub fn reconcile_versioned(
    observed: User,
    client_id: Option<&str>,
    stored: Option<MetaUser>,
) -> Reconciliation<MetaUser> {
    let observed = ensure_updated_at(observed);
    let observed = MetaUser::from_user(&observed, client_id);

    match stored {
        None => Reconciliation::Insert(observed),
        Some(mut stored) => {
            if merge_versioned(&mut stored, observed) {
                Reconciliation::Update(stored)
            } else {
                Reconciliation::Unchanged
            }
        }
    }
}

/// Merge an observation into the stored record. Returns whether anything changed.
pub fn merge_versioned(stored: &mut MetaUser, observed: MetaUser) -> bool {
    let mut changed = false;
    changed |= merge_group(&mut stored.phones, observed.phones);
    changed |= merge_group(&mut stored.address, observed.address);
    changed |= merge_group(&mut stored.email, observed.email);
    changed |= merge_group(&mut stored.username, observed.username);
    changed |= merge_group(&mut stored.status, observed.status);

    // Password carries no comparable payload: only its first observation counts
    if stored.password.is_none() && observed.password.is_some() {
        stored.password = observed.password;
        changed = true;
    }

    if changed {
        stored.updated_at = observed.updated_at;
    }
    changed
}

fn merge_group<T: ValueSnapshot>(
    stored: &mut Option<Versioned<T>>,
    observed: Option<Versioned<T>>,
) -> bool {
    let Some(observed) = observed else {
        return false;
    };

    match stored {
        Some(current) if current.new_value.equivalent(&observed.new_value) => false,
        Some(current) => {
            let previous = mem::replace(&mut current.new_value, observed.new_value);
            current.last_value = Some(previous);
            true
        }
        None => {
            *stored = Some(observed);
            true
        }
    }
}

pub fn reconcile_flat(observed: User, stored: Option<User>) -> Reconciliation<User> {
    let observed = ensure_updated_at(observed);

    match stored {
        None => Reconciliation::Insert(observed),
        Some(mut stored) => {
            if merge_flat(&mut stored, &observed) {
                Reconciliation::Update(stored)
            } else {
                Reconciliation::Unchanged
            }
        }
    }
}

/// Overwrite stored fields with every non-empty observed field.
///
/// `updated_at` is always taken from the observation. Returns whether the
/// stored record changed.
pub fn merge_flat(stored: &mut User, observed: &User) -> bool {
    let before = stored.clone();

    overwrite_if_present(&mut stored.email, &observed.email);
    overwrite_if_present(&mut stored.username, &observed.username);
    overwrite_if_present(&mut stored.name, &observed.name);
    overwrite_if_present(&mut stored.gender, &observed.gender);
    overwrite_if_present(&mut stored.status, &observed.status);
    overwrite_if_present(&mut stored.birth_date, &observed.birth_date);
    overwrite_if_present(&mut stored.client_id, &observed.client_id);

    if observed.phone.is_some() {
        stored.phone.clone_from(&observed.phone);
    }
    if observed.address.is_some() {
        stored.address.clone_from(&observed.address);
    }
    if observed.updated_at.is_some() {
        stored.updated_at = observed.updated_at;
    }

    *stored != before
}

fn overwrite_if_present(stored: &mut String, observed: &str) {
    if !observed.is_empty() && stored.as_str() != observed {
        *stored = observed.to_string();
    }
}
