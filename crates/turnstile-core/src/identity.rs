use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access level attached to an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Guest,
    User,
    Admin,
}

impl Right {
    /// Integer flag used by the persistence layer.
    pub fn as_flag(self) -> u8 {
        match self {
            Self::Guest => 0,
            Self::User => 1,
            Self::Admin => 2,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::Guest),
            1 => Some(Self::User),
            2 => Some(Self::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Right {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guest => write!(f, "guest"),
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Who is behind a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub nickname: String,
    pub right: Right,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, nickname: impl Into<String>, right: Right) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            right,
        }
    }

    /// Synthesize a spectator identity. Guests are never persisted.
    ///
    /// The id is the clock reading plus a random tail, so two guests in the
    /// same millisecond still differ.
    pub fn guest(now: DateTime<Utc>) -> Self {
        let tail = Uuid::now_v7().simple().to_string();
        let user_id = format!("guest{}-{}", now.timestamp_millis(), &tail[24..]);
        Self {
            nickname: user_id.clone(),
            user_id,
            right: Right::Guest,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.right == Right::Guest
    }

    pub fn is_admin(&self) -> bool {
        self.right == Right::Admin
    }
}

/// Login name and clear-text password as handed over by the transport layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub login_name: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn guest_identity_is_synthesized_from_clock() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let guest = Identity::guest(now);
        assert!(guest.user_id.starts_with("guest1700000000123-"));
        assert_eq!(guest.user_id.len(), "guest1700000000123-".len() + 8);
        assert_eq!(guest.nickname, guest.user_id);
        assert!(guest.is_guest());
        assert!(!guest.is_admin());
    }

    #[test]
    fn guests_in_the_same_millisecond_differ() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_ne!(Identity::guest(now).user_id, Identity::guest(now).user_id);
    }

    #[test]
    fn right_flag_mapping() {
        for right in [Right::Guest, Right::User, Right::Admin] {
            assert_eq!(Right::from_flag(right.as_flag()), Some(right));
        }
        assert_eq!(Right::from_flag(9), None);
    }

    #[test]
    fn credentials_use_camel_case() {
        let creds: Credentials =
            serde_json::from_str(r#"{"loginName":"alex","password":"pw"}"#).unwrap();
        assert_eq!(creds.login_name, "alex");
    }
}
