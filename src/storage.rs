//! Sled-backed persistence.
//!
//! Every entity is a JSON value in its own tree. Secondary trees hold the
//! unique indexes (usernames, organization names, template names). Writes
//! that touch more than one tree run in a sled transaction, so an aborted
//! write (e.g. a uniqueness conflict) leaves nothing behind.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, Transactional};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::auth::normalize_username;
use crate::error::{StorageError, StorageResult};
use crate::models::{
    Channel, Invoice, Membership, OrgRole, OrgStatus, Organization, Template, User, UserRole,
};

#[derive(Clone)] // Sled handles are cheap to clone and thread-safe
pub struct Storage {
    db: Db,
    users: Tree,
    usernames: Tree,
    invoices: Tree,
    organizations: Tree,
    org_names: Tree,
    memberships: Tree,
    templates: Tree,
    template_names: Tree,
    meta: Tree,
}

const BOOTSTRAP_ADMIN_KEY: &[u8] = b"bootstrap_admin";

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn id_from_ivec(bytes: &[u8], tree: &'static str) -> StorageResult<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StorageError::CorruptKey(tree))?;
    Ok(u64::from_be_bytes(raw))
}

/// Membership keys are `org_id (16 bytes) ++ user_id (8 bytes)` so one
/// organization's members form a contiguous prefix.
fn membership_key(org_id: Uuid, user_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(org_id.as_bytes());
    key.extend_from_slice(&id_key(user_id));
    key
}

fn org_name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn template_name_key(channel: Channel, name: &str) -> String {
    format!("{}/{}", channel, name.trim().to_lowercase())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn abort<T>(err: StorageError) -> ConflictableTransactionResult<T, StorageError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn scan<T: DeserializeOwned>(tree: &Tree) -> StorageResult<Vec<T>> {
    let mut rows = vec![];
    for item in tree.iter() {
        let (_, value) = item?;
        rows.push(decode(&value)?);
    }
    Ok(rows)
}

impl Storage {
    /// Open or create the Sled database at the given path.
    pub fn open(path: &str) -> StorageResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. Used by tests and dry runs.
    pub fn temporary() -> StorageResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            usernames: db.open_tree("usernames")?,
            invoices: db.open_tree("invoices")?,
            organizations: db.open_tree("organizations")?,
            org_names: db.open_tree("org_names")?,
            memberships: db.open_tree("memberships")?,
            templates: db.open_tree("templates")?,
            template_names: db.open_tree("template_names")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    pub async fn flush(&self) -> StorageResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn next_id(&self) -> StorageResult<u64> {
        // generate_id starts at 0; ids start at 1
        Ok(self.db.generate_id()? + 1)
    }

    // --- Users ---

    /// Inserts a new user. The username must already be normalized.
    pub fn create_user(
        &self,
        username: &str,
        email: Option<String>,
        password_hash: String,
        role: UserRole,
    ) -> StorageResult<User> {
        self.create_user_under(username, email, password_hash, role, None)
    }

    /// Like [`Storage::create_user`], linking the account to `parent_id`.
    pub fn create_user_under(
        &self,
        username: &str,
        email: Option<String>,
        password_hash: String,
        role: UserRole,
        parent_id: Option<u64>,
    ) -> StorageResult<User> {
        let mut user = self.new_user(username, email, password_hash, role)?;
        user.parent_id = parent_id;
        self.insert_user(&user, false)?;
        Ok(user)
    }

    /// Creates the first admin. Only one caller ever wins the bootstrap
    /// marker; every later attempt is a conflict, even when racing.
    pub fn create_bootstrap_admin(
        &self,
        username: &str,
        email: Option<String>,
        password_hash: String,
    ) -> StorageResult<User> {
        let user = self.new_user(username, email, password_hash, UserRole::Admin)?;
        self.insert_user(&user, true)?;
        Ok(user)
    }

    fn new_user(
        &self,
        username: &str,
        email: Option<String>,
        password_hash: String,
        role: UserRole,
    ) -> StorageResult<User> {
        let now = Utc::now();
        Ok(User {
            id: self.next_id()?,
            username: username.to_string(),
            email,
            password_hash,
            role,
            parent_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn insert_user(&self, user: &User, claim_bootstrap: bool) -> StorageResult<()> {
        let bytes = encode(user)?;
        let key = id_key(user.id);

        (&self.users, &self.usernames, &self.meta).transaction(|(users, usernames, meta)| {
            if claim_bootstrap && meta.insert(BOOTSTRAP_ADMIN_KEY, &key[..])?.is_some() {
                return abort(StorageError::Conflict("admin".to_string()));
            }
            if usernames.get(user.username.as_bytes())?.is_some() {
                return abort(StorageError::Conflict(format!("user {}", user.username)));
            }
            usernames.insert(user.username.as_bytes(), &key[..])?;
            users.insert(&key[..], bytes.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get_user(&self, id: u64) -> StorageResult<Option<User>> {
        match self.users.get(id_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_user_by_username(&self, username: &str) -> StorageResult<Option<User>> {
        match self.usernames.get(username.as_bytes())? {
            Some(id) => self.get_user(id_from_ivec(&id, "usernames")?),
            None => Ok(None),
        }
    }

    /// Case-insensitive email lookup. Emails are not indexed, so this scans.
    pub fn get_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        let email = email.trim();
        Ok(scan::<User>(&self.users)?
            .into_iter()
            .find(|u| u.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email))))
    }

    pub fn update_user(&self, user: &User) -> StorageResult<()> {
        if !self.users.contains_key(id_key(user.id))? {
            return Err(StorageError::NotFound(format!("user {}", user.id)));
        }
        self.users.insert(id_key(user.id), encode(user)?)?;
        Ok(())
    }

    pub fn any_admin(&self) -> StorageResult<bool> {
        Ok(scan::<User>(&self.users)?.iter().any(User::is_admin))
    }

    /// Creates the user, or resets the password of the account matching the
    /// username (or, failing that, the email). The username is normalized
    /// here so seeded accounts can log in the same way registered ones do.
    /// Startup seeding relies on this being idempotent.
    pub fn ensure_user(
        &self,
        username: &str,
        email: Option<String>,
        password_hash: String,
        role: UserRole,
    ) -> StorageResult<User> {
        let username = normalize_username(username);
        let existing = match self.get_user_by_username(&username)? {
            Some(user) => Some(user),
            None => match email.as_deref() {
                Some(email) => self.get_user_by_email(email)?,
                None => None,
            },
        };
        if let Some(mut user) = existing {
            user.password_hash = password_hash;
            user.updated_at = Utc::now();
            self.update_user(&user)?;
            return Ok(user);
        }
        self.create_user(&username, email, password_hash, role)
    }

    // --- Invoices ---

    /// Stores a new invoice, assigning its id.
    pub fn create_invoice(&self, mut invoice: Invoice) -> StorageResult<Invoice> {
        invoice.id = self.next_id()?;
        self.invoices.insert(id_key(invoice.id), encode(&invoice)?)?;
        Ok(invoice)
    }

    pub fn get_invoice(&self, id: u64) -> StorageResult<Option<Invoice>> {
        match self.invoices.get(id_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All invoices in creation order.
    pub fn list_invoices(&self) -> StorageResult<Vec<Invoice>> {
        scan(&self.invoices)
    }

    pub fn update_invoice(&self, invoice: &Invoice) -> StorageResult<()> {
        if !self.invoices.contains_key(id_key(invoice.id))? {
            return Err(StorageError::NotFound(format!("invoice {}", invoice.id)));
        }
        self.invoices.insert(id_key(invoice.id), encode(invoice)?)?;
        Ok(())
    }

    pub fn delete_invoice(&self, id: u64) -> StorageResult<()> {
        match self.invoices.remove(id_key(id))? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(format!("invoice {}", id))),
        }
    }

    // --- Organizations & memberships ---

    /// Creates an active organization and makes `owner_id` its owner.
    pub fn create_organization(&self, name: &str, owner_id: u64) -> StorageResult<(Organization, Membership)> {
        let now = Utc::now();
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            status: OrgStatus::Active,
            created_at: now,
        };
        let owner = Membership {
            id: Uuid::new_v4(),
            user_id: owner_id,
            org_id: org.id,
            role: OrgRole::Owner,
            created_at: now,
        };
        let org_bytes = encode(&org)?;
        let owner_bytes = encode(&owner)?;
        let name_key = org_name_key(&org.name);
        let mem_key = membership_key(org.id, owner_id);

        (&self.organizations, &self.org_names, &self.memberships).transaction(
            |(organizations, org_names, memberships)| {
                if org_names.get(name_key.as_bytes())?.is_some() {
                    return abort(StorageError::Conflict(format!("organization {}", org.name)));
                }
                org_names.insert(name_key.as_bytes(), &org.id.as_bytes()[..])?;
                organizations.insert(&org.id.as_bytes()[..], org_bytes.as_slice())?;
                memberships.insert(mem_key.as_slice(), owner_bytes.as_slice())?;
                Ok(())
            },
        )?;

        Ok((org, owner))
    }

    pub fn get_organization(&self, id: Uuid) -> StorageResult<Option<Organization>> {
        match self.organizations.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_organization_status(&self, id: Uuid, status: OrgStatus) -> StorageResult<Organization> {
        let mut org = self
            .get_organization(id)?
            .ok_or_else(|| StorageError::NotFound(format!("organization {}", id)))?;
        org.status = status;
        self.organizations.insert(id.as_bytes(), encode(&org)?)?;
        Ok(org)
    }

    /// Organizations the user belongs to, with the user's role in each.
    pub fn organizations_for_user(&self, user_id: u64) -> StorageResult<Vec<(Organization, OrgRole)>> {
        let mut result = vec![];
        for membership in scan::<Membership>(&self.memberships)? {
            if membership.user_id != user_id {
                continue;
            }
            if let Some(org) = self.get_organization(membership.org_id)? {
                result.push((org, membership.role));
            }
        }
        Ok(result)
    }

    pub fn get_membership(&self, org_id: Uuid, user_id: u64) -> StorageResult<Option<Membership>> {
        match self.memberships.get(membership_key(org_id, user_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Adds the user to the organization, or changes the role of an existing
    /// membership (keeping its id and creation time).
    pub fn upsert_membership(&self, org_id: Uuid, user_id: u64, role: OrgRole) -> StorageResult<Membership> {
        let key = membership_key(org_id, user_id);
        let fresh = Membership {
            id: Uuid::new_v4(),
            user_id,
            org_id,
            role,
            created_at: Utc::now(),
        };

        let stored = self.memberships.transaction(|memberships| {
            let membership = match memberships.get(key.as_slice())? {
                Some(bytes) => {
                    let mut existing: Membership = match serde_json::from_slice(&bytes) {
                        Ok(m) => m,
                        Err(e) => return abort(StorageError::Json(e)),
                    };
                    existing.role = role;
                    existing
                }
                None => fresh.clone(),
            };
            let bytes = match serde_json::to_vec(&membership) {
                Ok(b) => b,
                Err(e) => return abort(StorageError::Json(e)),
            };
            memberships.insert(key.as_slice(), bytes)?;
            Ok(membership)
        })?;

        Ok(stored)
    }

    pub fn list_memberships(&self, org_id: Uuid) -> StorageResult<Vec<Membership>> {
        let mut rows = vec![];
        for item in self.memberships.scan_prefix(org_id.as_bytes()) {
            let (_, value) = item?;
            rows.push(decode(&value)?);
        }
        Ok(rows)
    }

    // --- Templates ---

    pub fn create_template(&self, name: &str, channel: Channel, body: &str) -> StorageResult<Template> {
        let template = Template {
            id: self.next_id()?,
            name: name.trim().to_string(),
            channel,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        let bytes = encode(&template)?;
        let key = id_key(template.id);
        let name_key = template_name_key(channel, &template.name);

        (&self.templates, &self.template_names).transaction(|(templates, names)| {
            if names.get(name_key.as_bytes())?.is_some() {
                return abort(StorageError::Conflict(format!("template {}", name_key)));
            }
            names.insert(name_key.as_bytes(), &key[..])?;
            templates.insert(&key[..], bytes.as_slice())?;
            Ok(())
        })?;

        Ok(template)
    }

    pub fn get_template_by_name(&self, channel: Channel, name: &str) -> StorageResult<Option<Template>> {
        let Some(id) = self.template_names.get(template_name_key(channel, name))? else {
            return Ok(None);
        };
        match self.templates.get(id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_templates(&self) -> StorageResult<Vec<Template>> {
        scan(&self.templates)
    }

    pub fn delete_template(&self, id: u64) -> StorageResult<()> {
        let key = id_key(id);
        let Some(bytes) = self.templates.get(key)? else {
            return Err(StorageError::NotFound(format!("template {}", id)));
        };
        let template: Template = decode(&bytes)?;
        let name_key = template_name_key(template.channel, &template.name);

        (&self.templates, &self.template_names).transaction(|(templates, names)| {
            templates.remove(&key[..])?;
            names.remove(name_key.as_bytes())?;
            Ok::<_, ConflictableTransactionError<StorageError>>(())
        })?;
        Ok(())
    }
}
