use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use crate::error::{Error, Result};
use crate::models::{Contract, EntityKind, Id, MaintenanceRequest, Payment, Property, User};

/// Result of a step inside a sled transaction; `abort` carries a domain error
pub type TxResult<T> = ConflictableTransactionResult<T, Error>;

/// Abort the surrounding transaction with a domain error
pub fn fail<T>(err: impl Into<Error>) -> TxResult<T> {
    abort(err.into())
}

/// Lift a plain `Result` into a transaction step
pub fn lift<T>(result: Result<T>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

/// A record stored in its own tree, keyed by big-endian id.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn id(&self) -> Id;
}

impl Record for User {
    const KIND: EntityKind = EntityKind::User;
    fn id(&self) -> Id {
        self.id
    }
}

impl Record for Property {
    const KIND: EntityKind = EntityKind::Property;
    fn id(&self) -> Id {
        self.id
    }
}

impl Record for Contract {
    const KIND: EntityKind = EntityKind::Contract;
    fn id(&self) -> Id {
        self.id
    }
}

impl Record for Payment {
    const KIND: EntityKind = EntityKind::Payment;
    fn id(&self) -> Id {
        self.id
    }
}

impl Record for MaintenanceRequest {
    const KIND: EntityKind = EntityKind::MaintenanceRequest;
    fn id(&self) -> Id {
        self.id
    }
}

/// Parent -> children lists kept in the `relations` tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    OwnedProperties,
    TenantContracts,
    RequestedMaintenance,
    AssignedMaintenance,
    PropertyContracts,
    PropertyMaintenance,
    ContractPayments,
}

impl Relation {
    fn key(self, parent: Id) -> Vec<u8> {
        let tag = match self {
            Relation::OwnedProperties => "user/properties",
            Relation::TenantContracts => "user/contracts",
            Relation::RequestedMaintenance => "user/requested",
            Relation::AssignedMaintenance => "user/assigned",
            Relation::PropertyContracts => "property/contracts",
            Relation::PropertyMaintenance => "property/maintenance",
            Relation::ContractPayments => "contract/payments",
        };
        let mut key = tag.as_bytes().to_vec();
        key.push(b'/');
        key.extend_from_slice(&parent.to_be_bytes());
        key
    }
}

pub(crate) fn id_key(id: Id) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_id(bytes: &[u8]) -> Option<Id> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(Id::from_be_bytes(raw))
}

/// sled-backed store for every ledger record.
///
/// Records live in one tree per entity. Uniqueness constraints are index
/// trees checked and written inside the same transaction as the record, so
/// they hold at commit time even under concurrent writers.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    users: Tree,
    user_emails: Tree,
    properties: Tree,
    contracts: Tree,
    payments: Tree,
    payment_refs: Tree,
    maintenance: Tree,
    // property id -> id of its single active contract
    active_contracts: Tree,
    relations: Tree,
}

impl Storage {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            user_emails: db.open_tree("user_emails")?,
            properties: db.open_tree("properties")?,
            contracts: db.open_tree("contracts")?,
            payments: db.open_tree("payments")?,
            payment_refs: db.open_tree("payment_refs")?,
            maintenance: db.open_tree("maintenance")?,
            active_contracts: db.open_tree("active_contracts")?,
            relations: db.open_tree("relations")?,
            db,
        })
    }

    /// Allocate a fresh, monotonically increasing id (never 0)
    pub fn next_id(&self) -> Result<Id> {
        Ok(self.db.generate_id()? + 1)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn tree(&self, kind: EntityKind) -> &Tree {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Property => &self.properties,
            EntityKind::Contract => &self.contracts,
            EntityKind::Payment => &self.payments,
            EntityKind::MaintenanceRequest => &self.maintenance,
        }
    }

    /// Run `f` as one atomic unit over every tree.
    ///
    /// sled may call `f` more than once when it detects a conflicting
    /// concurrent transaction, so `f` must not have side effects outside `tx`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        let trees = (
            &self.users,
            &self.user_emails,
            &self.properties,
            &self.contracts,
            &self.payments,
            &self.payment_refs,
            &self.maintenance,
            &self.active_contracts,
            &self.relations,
        );
        trees
            .transaction(
                |(
                    users,
                    user_emails,
                    properties,
                    contracts,
                    payments,
                    payment_refs,
                    maintenance,
                    active_contracts,
                    relations,
                )| {
                    f(&Tx {
                        users,
                        user_emails,
                        properties,
                        contracts,
                        payments,
                        payment_refs,
                        maintenance,
                        active_contracts,
                        relations,
                    })
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => Error::Storage(err),
            })
    }

    // --- Non-transactional reads (never block writers) ---

    pub fn get<T: Record>(&self, id: Id) -> Result<Option<T>> {
        match self.tree(T::KIND).get(id_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn fetch<T: Record>(&self, id: Id) -> Result<T> {
        self.get(id)?.ok_or(Error::not_found(T::KIND, id))
    }

    /// Every record of a kind, ascending by id
    pub fn scan<T: Record>(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree(T::KIND).iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn active_contract_for(&self, property_id: Id) -> Result<Option<Id>> {
        Ok(self
            .active_contracts
            .get(id_key(property_id))?
            .and_then(|v| decode_id(&v)))
    }

    pub fn children(&self, rel: Relation, parent: Id) -> Result<Vec<Id>> {
        match self.relations.get(rel.key(parent))? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        match self.user_emails.get(normalize_email(email).as_bytes())? {
            Some(raw) => match decode_id(&raw) {
                Some(id) => self.get(id),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Typed view over the transactional trees of one write.
pub struct Tx<'a> {
    users: &'a TransactionalTree,
    user_emails: &'a TransactionalTree,
    properties: &'a TransactionalTree,
    contracts: &'a TransactionalTree,
    payments: &'a TransactionalTree,
    payment_refs: &'a TransactionalTree,
    maintenance: &'a TransactionalTree,
    active_contracts: &'a TransactionalTree,
    relations: &'a TransactionalTree,
}

impl<'a> Tx<'a> {
    fn tree(&self, kind: EntityKind) -> &'a TransactionalTree {
        match kind {
            EntityKind::User => self.users,
            EntityKind::Property => self.properties,
            EntityKind::Contract => self.contracts,
            EntityKind::Payment => self.payments,
            EntityKind::MaintenanceRequest => self.maintenance,
        }
    }

    pub fn get<T: Record>(&self, id: Id) -> TxResult<Option<T>> {
        match self.tree(T::KIND).get(id_key(id))? {
            Some(bytes) => lift(decode(&bytes)).map(Some),
            None => Ok(None),
        }
    }

    /// Like `get`, aborting with `NotFound` when absent
    pub fn fetch<T: Record>(&self, id: Id) -> TxResult<T> {
        match self.get(id)? {
            Some(record) => Ok(record),
            None => fail(Error::not_found(T::KIND, id)),
        }
    }

    pub fn put<T: Record>(&self, record: &T) -> TxResult<()> {
        let bytes = lift(serde_json::to_vec(record).map_err(Error::from))?;
        self.tree(T::KIND).insert(id_key(record.id()), bytes)?;
        Ok(())
    }

    pub fn remove<T: Record>(&self, id: Id) -> TxResult<()> {
        self.tree(T::KIND).remove(id_key(id))?;
        Ok(())
    }

    // --- relation lists ---

    pub fn children(&self, rel: Relation, parent: Id) -> TxResult<Vec<Id>> {
        match self.relations.get(rel.key(parent))? {
            Some(bytes) => lift(decode(&bytes)),
            None => Ok(Vec::new()),
        }
    }

    fn store_children(&self, rel: Relation, parent: Id, ids: &[Id]) -> TxResult<()> {
        if ids.is_empty() {
            self.relations.remove(rel.key(parent))?;
        } else {
            let bytes = lift(serde_json::to_vec(ids).map_err(Error::from))?;
            self.relations.insert(rel.key(parent), bytes)?;
        }
        Ok(())
    }

    pub fn link(&self, rel: Relation, parent: Id, child: Id) -> TxResult<()> {
        let mut ids = self.children(rel, parent)?;
        if let Err(pos) = ids.binary_search(&child) {
            ids.insert(pos, child);
        }
        self.store_children(rel, parent, &ids)
    }

    pub fn unlink(&self, rel: Relation, parent: Id, child: Id) -> TxResult<()> {
        let mut ids = self.children(rel, parent)?;
        ids.retain(|&c| c != child);
        self.store_children(rel, parent, &ids)
    }

    pub fn drop_children(&self, rel: Relation, parent: Id) -> TxResult<()> {
        self.relations.remove(rel.key(parent))?;
        Ok(())
    }

    // --- one active contract per property ---

    pub fn active_contract(&self, property_id: Id) -> TxResult<Option<Id>> {
        Ok(self
            .active_contracts
            .get(id_key(property_id))?
            .and_then(|v| decode_id(&v)))
    }

    /// Claim the property's active slot; aborts with `Conflict` when taken
    pub fn claim_active(&self, property_id: Id, contract_id: Id) -> TxResult<()> {
        if let Some(holder) = self.active_contract(property_id)? {
            if holder != contract_id {
                return fail(Error::conflict(format!(
                    "property {} already has active contract {}",
                    property_id, holder
                )));
            }
        }
        self.active_contracts
            .insert(id_key(property_id), id_key(contract_id))?;
        Ok(())
    }

    /// Release the slot if `contract_id` holds it
    pub fn release_active(&self, property_id: Id, contract_id: Id) -> TxResult<()> {
        if self.active_contract(property_id)? == Some(contract_id) {
            self.active_contracts.remove(id_key(property_id))?;
        }
        Ok(())
    }

    // --- unique emails ---

    pub fn claim_email(&self, email: &str, user_id: Id) -> TxResult<()> {
        let key = normalize_email(email);
        if let Some(raw) = self.user_emails.get(key.as_bytes())? {
            if decode_id(&raw) != Some(user_id) {
                return fail(Error::conflict_on(
                    "email",
                    format!("email {} is already registered", key),
                ));
            }
        }
        self.user_emails.insert(key.as_bytes(), id_key(user_id))?;
        Ok(())
    }

    pub fn release_email(&self, email: &str) -> TxResult<()> {
        self.user_emails.remove(normalize_email(email).as_bytes())?;
        Ok(())
    }

    // --- unique payment references ---

    pub fn claim_reference(&self, reference: &str, payment_id: Id) -> TxResult<()> {
        if let Some(raw) = self.payment_refs.get(reference.as_bytes())? {
            if decode_id(&raw) != Some(payment_id) {
                return fail(Error::conflict_on(
                    "reference",
                    format!("payment reference {} is already used", reference),
                ));
            }
        }
        self.payment_refs
            .insert(reference.as_bytes(), id_key(payment_id))?;
        Ok(())
    }

    /// Payment holding `reference`, if any
    pub fn reference_holder(&self, reference: &str) -> TxResult<Option<Id>> {
        Ok(self
            .payment_refs
            .get(reference.as_bytes())?
            .and_then(|raw| decode_id(&raw)))
    }

    pub fn release_reference(&self, reference: &str) -> TxResult<()> {
        self.payment_refs.remove(reference.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::UserRole;

    fn sample_user(id: Id, email: &str) -> User {
        User {
            id,
            email: email.to_string(),
            hashed_password: "hash".to_string(),
            full_name: None,
            phone: None,
            role: UserRole::Owner,
            is_active: true,
        }
    }

    #[test]
    fn test_put_get_and_scan_in_id_order() {
        let storage = Storage::temporary().expect("Failed to open storage");
        let ids: Vec<Id> = (0..3).map(|_| storage.next_id().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids[0] > 0);

        storage
            .transaction(|tx| {
                for (i, id) in ids.iter().rev().enumerate() {
                    tx.put(&sample_user(*id, &format!("u{}@x.io", i)))?;
                }
                Ok(())
            })
            .expect("Insert failed");

        let users: Vec<User> = storage.scan().unwrap();
        assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), ids);
        assert!(storage.get::<User>(9_999).unwrap().is_none());
        let err = storage.fetch::<User>(9_999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_aborted_transaction_applies_nothing() {
        let storage = Storage::temporary().unwrap();
        let result: Result<()> = storage.transaction(|tx| {
            tx.put(&sample_user(1, "a@x.io"))?;
            tx.link(Relation::OwnedProperties, 1, 10)?;
            fail(Error::conflict("boom"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
        assert!(storage.get::<User>(1).unwrap().is_none());
        assert!(storage.children(Relation::OwnedProperties, 1).unwrap().is_empty());
    }

    #[test]
    fn test_relation_lists_stay_sorted_and_deduplicated() {
        let storage = Storage::temporary().unwrap();
        storage
            .transaction(|tx| {
                tx.link(Relation::PropertyContracts, 7, 30)?;
                tx.link(Relation::PropertyContracts, 7, 10)?;
                tx.link(Relation::PropertyContracts, 7, 30)?;
                tx.link(Relation::PropertyContracts, 7, 20)?;
                tx.unlink(Relation::PropertyContracts, 7, 20)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(storage.children(Relation::PropertyContracts, 7).unwrap(), vec![10, 30]);
        assert!(storage.children(Relation::PropertyContracts, 8).unwrap().is_empty());
    }

    #[test]
    fn test_unique_indexes() {
        let storage = Storage::temporary().unwrap();
        storage.transaction(|tx| tx.claim_email("Owner@X.io", 1)).unwrap();
        // same owner may re-claim
        storage.transaction(|tx| tx.claim_email("owner@x.io ", 1)).unwrap();
        let err = storage
            .transaction(|tx| tx.claim_email("OWNER@x.io", 2))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.fields(), vec!["email"]);

        storage.transaction(|tx| tx.claim_active(5, 100)).unwrap();
        let err = storage.transaction(|tx| tx.claim_active(5, 101)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        storage.transaction(|tx| tx.release_active(5, 101)).unwrap();
        assert_eq!(storage.active_contract_for(5).unwrap(), Some(100));
        storage.transaction(|tx| tx.release_active(5, 100)).unwrap();
        assert_eq!(storage.active_contract_for(5).unwrap(), None);
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.transaction(|tx| tx.put(&sample_user(3, "p@x.io"))).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.fetch::<User>(3).unwrap().email, "p@x.io");
    }
}
