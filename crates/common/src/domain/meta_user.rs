use crate::domain::result::DomainResult;
use crate::domain::user::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a snapshot came from. Never part of a snapshot's business content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Provenance {
    pub fn new(client_id: Option<&str>, updated_at: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.filter(|c| !c.is_empty()).map(str::to_string),
            updated_at: Some(updated_at),
        }
    }
}

/// A versioned attribute value carrying provenance metadata.
pub trait ValueSnapshot: Clone + PartialEq {
    fn provenance(&self) -> &Provenance;

    fn provenance_mut(&mut self) -> &mut Provenance;

    /// Structural equality that ignores provenance.
    fn equivalent(&self, other: &Self) -> bool {
        let mut lhs = self.clone();
        let mut rhs = other.clone();
        *lhs.provenance_mut() = Provenance::default();
        *rhs.provenance_mut() = Provenance::default();
        lhs == rhs
    }
}

macro_rules! value_snapshot {
    ($($snapshot:ty),+ $(,)?) => {
        $(
            impl ValueSnapshot for $snapshot {
                fn provenance(&self) -> &Provenance {
                    &self.provenance
                }

                fn provenance_mut(&mut self) -> &mut Provenance {
                    &mut self.provenance
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(default, rename = "cellphone", skip_serializing_if = "String::is_empty")]
    pub cell_phone: String,
    #[serde(default, rename = "ddd_cellphone", skip_serializing_if = "String::is_empty")]
    pub ddd_cell_phone: String,
    #[serde(default)]
    pub mobile_phone_confirmed: bool,
    #[serde(flatten)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<CitySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<CountrySnapshot>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub neighborhood: String,
    #[serde(default, rename = "zipCode", skip_serializing_if = "String::is_empty")]
    pub zip_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address2: String,
    #[serde(default, rename = "addressType", skip_serializing_if = "String::is_empty")]
    pub address_type: String,
    #[serde(default)]
    pub number: i64,
    #[serde(flatten)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitySnapshot {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub ibge_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub ibge_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub abbreviation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountrySnapshot {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Password changes are tracked by provenance only; the secret never leaves the user API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordSnapshot {
    #[serde(flatten)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(flatten)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(flatten)]
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(flatten)]
    pub provenance: Provenance,
}

value_snapshot!(
    PhoneSnapshot,
    AddressSnapshot,
    PasswordSnapshot,
    EmailSnapshot,
    UsernameSnapshot,
    StatusSnapshot,
);

/// Attribute group: the latest observation plus the one it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<T>,
    pub new_value: T,
}

impl<T> Versioned<T> {
    /// First observation of a group: no history yet.
    pub fn observed(value: T) -> Self {
        Self {
            last_value: None,
            new_value: value,
        }
    }
}

/// Per-attribute history of a user, keyed by user id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaUser {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phones: Option<Versioned<PhoneSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Versioned<AddressSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Versioned<PasswordSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Versioned<EmailSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Versioned<UsernameSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Versioned<StatusSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetaUser {
    /// Build a first-observation record from a user.
    ///
    /// Every comparable group is present so that a cleared attribute replaces
    /// the stored one. An absent phone or address becomes an empty snapshot
    /// with no provenance. The caller is expected to have resolved
    /// `updated_at` already; a missing timestamp leaves the provenance without one.
    pub fn from_user(user: &User, client_id: Option<&str>) -> Self {
        let provenance = Provenance {
            client_id: client_id.filter(|c| !c.is_empty()).map(str::to_string),
            updated_at: user.updated_at,
        };

        let phones = user
            .phone
            .as_ref()
            .map(|phone| PhoneSnapshot {
                phone: phone.phone.clone(),
                cell_phone: phone.cell_phone.clone(),
                ddd_cell_phone: phone.ddd_cell_phone.clone(),
                mobile_phone_confirmed: phone.mobile_phone_confirmed,
                provenance: provenance.clone(),
            })
            .unwrap_or_default();

        let address = user
            .address
            .as_ref()
            .map(|address| AddressSnapshot {
                city: Some(CitySnapshot {
                    id: address.city.id,
                    ibge_id: address.city.ibge_city_id,
                    name: address.city.name.clone(),
                }),
                state: Some(StateSnapshot {
                    id: address.state.id,
                    ibge_id: address.state.ibge_state_id,
                    name: address.state.name.clone(),
                    abbreviation: address.state.abbreviation.clone(),
                }),
                country: Some(CountrySnapshot {
                    id: address.country.id,
                    name: address.country.name.clone(),
                }),
                neighborhood: address.neighborhood.clone(),
                zip_code: address.zip_code.clone(),
                address1: address.address1.clone(),
                address2: address.address2.clone(),
                address_type: address.address_type.clone(),
                number: address.number,
                provenance: provenance.clone(),
            })
            .unwrap_or_default();

        Self {
            id: user.id.clone(),
            phones: Some(Versioned::observed(phones)),
            address: Some(Versioned::observed(address)),
            password: Some(Versioned::observed(PasswordSnapshot {
                provenance: provenance.clone(),
            })),
            email: Some(Versioned::observed(EmailSnapshot {
                email: user.email.clone(),
                provenance: provenance.clone(),
            })),
            username: Some(Versioned::observed(UsernameSnapshot {
                username: user.username.clone(),
                provenance: provenance.clone(),
            })),
            status: Some(Versioned::observed(StatusSnapshot {
                status: user.status.clone(),
                provenance,
            })),
            updated_at: user.updated_at,
        }
    }
}

/// Live versioned user collection
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MetaUserRepository: Send + Sync {
    /// Returns `DomainError::DocumentNotFound` when no record is stored for the id
    async fn get_meta_user(&self, user_id: &str) -> DomainResult<MetaUser>;

    /// Insert a new record, returning its id
    async fn insert_meta_user(&self, meta_user: MetaUser) -> DomainResult<String>;

    async fn update_meta_user(&self, meta_user: MetaUser) -> DomainResult<()>;

    async fn remove_meta_user(&self, user_id: &str) -> DomainResult<()>;
}

/// Historical copies of removed versioned users
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ArchivedMetaUserRepository: Send + Sync {
    async fn archive_meta_user(&self, meta_user: MetaUser) -> DomainResult<String>;
}
