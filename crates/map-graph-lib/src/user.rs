//! Interned user records
//!
//! Thousands of primitives usually share a handful of authors, so user records are
//! interned and primitives hold an `Arc<User>`.

use dashmap::DashMap;
use std::sync::{Arc, LazyLock};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Author of a primitive version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct User {
    /// Server-side user id; 0 for the anonymous user
    pub id: i64,
    pub name: String,
}

impl User {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id == 0
    }
}

/// Registry handing out one shared record per user id
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: DashMap<i64, Arc<User>>,
}

static GLOBAL: LazyLock<UserRegistry> = LazyLock::new(UserRegistry::new);

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static UserRegistry {
        &GLOBAL
    }

    /// Shared record for `id`, created on first use
    ///
    /// A later call with a different name replaces the record (users can be renamed);
    /// primitives keep the record they were given.
    pub fn get_or_create(&self, id: i64, name: &str) -> Arc<User> {
        if let Some(existing) = self.users.get(&id) {
            if existing.name == name {
                return existing.clone();
            }
        }
        let user = Arc::new(User::new(id, name));
        self.users.insert(id, user.clone());
        user
    }

    pub fn get(&self, id: i64) -> Option<Arc<User>> {
        self.users.get(&id).map(|u| u.clone())
    }

    /// Intern a detached user record
    pub fn intern(&self, user: &User) -> Arc<User> {
        self.get_or_create(user.id, &user.name)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
