// heed based KV store, the system of record for machines, leases and subdomains

use anyhow::{Context, Result};
use heed::{
    Database, Env, EnvOpenOptions, RoTxn, RwTxn, WithTls,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{marker::PhantomData, path::Path};
use tokio::fs::create_dir_all;

use crate::data::Collections;

pub struct Key<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

pub struct PartialKey<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

impl<D> Key<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(collection: Collections, id: impl AsRef<str>) -> Self {
        Key(
            format!("{}/{}", collection.as_ref(), id.as_ref()),
            PhantomData,
        )
    }

    pub fn scoped(collection: Collections, scope: impl AsRef<str>, id: impl AsRef<str>) -> Self {
        Key(
            format!("{}/{}/{}", collection.as_ref(), scope.as_ref(), id.as_ref()),
            PhantomData,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<D> Clone for Key<D>
where
    D: Serialize + DeserializeOwned,
{
    fn clone(&self) -> Self {
        Key(self.0.clone(), PhantomData)
    }
}

impl<D> PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn collection(collection: Collections) -> Self {
        PartialKey(format!("{}/", collection.as_ref()), PhantomData)
    }

    pub fn scoped(collection: Collections, scope: impl AsRef<str>) -> Self {
        PartialKey(
            format!("{}/{}/", collection.as_ref(), scope.as_ref()),
            PhantomData,
        )
    }
}

pub struct ReadTxn<'a> {
    db: Database<Str, Bytes>,
    txn: RoTxn<'a, WithTls>,
}

pub struct WriteTxn<'a> {
    db: Database<Str, Bytes>,
    txn: RwTxn<'a>,
}

impl ReadTxn<'_> {
    pub fn get<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<Option<D>> {
        let value = self.db.get(&self.txn, &key.0)?;
        value
            .map(|v| serde_json::from_slice(v).context("failed to decode stored value"))
            .transpose()
    }

    pub fn list<D: Serialize + DeserializeOwned>(&self, key: &PartialKey<D>) -> Result<Vec<D>> {
        let mut values = Vec::new();
        for item in self.db.prefix_iter(&self.txn, &key.0)? {
            let (_, v) = item?;
            values.push(serde_json::from_slice(v).context("failed to decode stored value")?);
        }
        Ok(values)
    }
}

impl WriteTxn<'_> {
    pub fn get<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<Option<D>> {
        let value = self.db.get(&self.txn, &key.0)?;
        value
            .map(|v| serde_json::from_slice(v).context("failed to decode stored value"))
            .transpose()
    }

    pub fn exists<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<bool> {
        Ok(self.db.get(&self.txn, &key.0)?.is_some())
    }

    pub fn list<D: Serialize + DeserializeOwned>(&self, key: &PartialKey<D>) -> Result<Vec<D>> {
        let mut values = Vec::new();
        for item in self.db.prefix_iter(&self.txn, &key.0)? {
            let (_, v) = item?;
            values.push(serde_json::from_slice(v).context("failed to decode stored value")?);
        }
        Ok(values)
    }

    pub fn put<D: Serialize + DeserializeOwned>(&mut self, key: &Key<D>, value: &D) -> Result<()> {
        let value = serde_json::to_vec(value)?;
        self.db.put(&mut self.txn, &key.0, &value)?;
        Ok(())
    }

    /// Returns whether the key was present.
    pub fn delete<D: Serialize + DeserializeOwned>(&mut self, key: &Key<D>) -> Result<bool> {
        Ok(self.db.delete(&mut self.txn, &key.0)?)
    }

    /// Monotonic counter, starting at 1.
    pub fn next_sequence(&mut self, name: &str) -> Result<u64> {
        let key = Key::<u64>::new(Collections::Sequence, name);
        let next = self.get(&key)?.unwrap_or(0) + 1;
        self.put(&key, &next)?;
        Ok(next)
    }
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if !dir_path.exists() {
            create_dir_all(dir_path).await?;
        }

        let env = unsafe { EnvOpenOptions::new().open(dir_path)? };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    /// Runs `f` against a consistent snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&ReadTxn<'_>) -> Result<R>) -> Result<R> {
        let txn = ReadTxn {
            db: self.db,
            txn: self.env.read_txn()?,
        };
        f(&txn)
    }

    /// Runs `f` inside a single write transaction. LMDB admits one writer at a time, so
    /// everything `f` reads is still true when it commits. Nothing is written if `f`
    /// returns an error.
    ///
    /// `f` must not block on async work: the write lock is held for its whole duration.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R>) -> Result<R> {
        self.try_write(f)
    }

    /// Like [`Store::write`] but lets `f` reject with a domain error.
    pub fn try_write<R, E>(
        &self,
        f: impl FnOnce(&mut WriteTxn<'_>) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        let mut txn = WriteTxn {
            db: self.db,
            txn: self.env.write_txn().map_err(anyhow::Error::from)?,
        };
        let result = f(&mut txn)?;
        txn.txn.commit().map_err(anyhow::Error::from)?;
        Ok(result)
    }

    pub fn get<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<Option<D>> {
        self.read(|txn| txn.get(key))
    }

    pub fn list<D: Serialize + DeserializeOwned>(&self, key: &PartialKey<D>) -> Result<Vec<D>> {
        self.read(|txn| txn.list(key))
    }

    pub fn put<D: Serialize + DeserializeOwned>(&self, key: &Key<D>, value: &D) -> Result<()> {
        self.write(|txn| txn.put(key, value))
    }

    pub fn delete<D: Serialize + DeserializeOwned>(&self, key: &Key<D>) -> Result<bool> {
        self.write(|txn| txn.delete(key))
    }
}
