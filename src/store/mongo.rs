use std::collections::HashMap;
use std::ops::Deref;

use log::{debug, warn};
use mongodb::{
    bson::{doc, Bson, Document},
    error::{Error as DbError, ErrorKind, WriteFailure},
    options::{FindOptions, UpdateOptions},
    Client, ClientSession, Collection, Database, IndexModel,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::{check_stamp, StoreError, TicketStore};
use crate::model::{
    alt_sign_addr::AltSignAddrData,
    hash::TxHash,
    request::{Action, RequestStamp},
    ticket::{FeeStatus, Ticket},
    vote_change::VoteChangeRecord,
};

const DUPLICATE_KEY: i32 = 11000;

/// Return true if the given result is a duplicate key write error.
fn is_duplicate_key_error(err: &DbError) -> bool {
    if let ErrorKind::Write(WriteFailure::WriteError(ref e)) = *err.kind {
        return e.code == DUPLICATE_KEY;
    }
    false
}

/// A type that can be directly inserted/read to/from the database.
trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Last accepted timestamp for one ticket and action.
#[derive(Debug, Serialize, Deserialize)]
struct StampDoc {
    #[serde(rename = "_id")]
    id: String,
    timestamp: i64,
}

fn stamp_id(hash: &TxHash, action: Action) -> String {
    format!("{hash}:{action}")
}

impl MongoCollection for Ticket {
    const NAME: &'static str = "tickets";
}
impl MongoCollection for AltSignAddrData {
    const NAME: &'static str = "alt_sign_addrs";
}
impl MongoCollection for VoteChangeRecord {
    const NAME: &'static str = "vote_changes";
}
impl MongoCollection for StampDoc {
    const NAME: &'static str = "request_stamps";
}

/// A [`TicketStore`] backed by MongoDB.
///
/// Writes run in multi-document transactions, so the server must be a replica
/// set member. A write conflict between two transactions surfaces as a
/// database error; it is never retried here.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        let store = Self { client, db };
        store.ensure_indexes_exist().await?;
        Ok(store)
    }

    fn coll<T: MongoCollection>(&self) -> Coll<T> {
        Coll::from_db(&self.db)
    }

    /// Ensure that all the required indexes exist.
    ///
    /// This operation is idempotent.
    async fn ensure_indexes_exist(&self) -> Result<(), DbError> {
        debug!("Ensuring collection indexes exist");

        let status_index = IndexModel::builder().keys(doc! {"fee_status": 1}).build();
        self.coll::<Ticket>()
            .create_index(status_index, None)
            .await?;

        let by_ticket = IndexModel::builder()
            .keys(doc! {"ticket_hash": 1, "_id": 1})
            .build();
        self.coll::<AltSignAddrData>()
            .create_index(by_ticket.clone(), None)
            .await?;
        self.coll::<VoteChangeRecord>()
            .create_index(by_ticket, None)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<ClientSession, DbError> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(session)
    }

    /// Commit if `result` is a success, otherwise abort.
    async fn finish<T>(
        mut session: ClientSession,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                session.commit_transaction().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!("Failed to abort transaction: {abort_err}");
                }
                Err(err)
            }
        }
    }

    async fn check_stamp(
        &self,
        session: &mut ClientSession,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let Some(stamp) = stamp else {
            return Ok(());
        };
        let last = self
            .coll::<StampDoc>()
            .find_one_with_session(
                doc! {"_id": stamp_id(&stamp.ticket_hash, stamp.action)},
                None,
                session,
            )
            .await?
            .map(|s| s.timestamp);
        check_stamp(stamp, last)
    }

    async fn record_stamp(
        &self,
        session: &mut ClientSession,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let Some(stamp) = stamp else {
            return Ok(());
        };
        self.coll::<StampDoc>()
            .update_one_with_session(
                doc! {"_id": stamp_id(&stamp.ticket_hash, stamp.action)},
                doc! {"$set": {"timestamp": stamp.timestamp}},
                UpdateOptions::builder().upsert(true).build(),
                session,
            )
            .await?;
        Ok(())
    }

    /// Fail unless the stored ticket is in fee status `expected`.
    async fn check_status(
        &self,
        session: &mut ClientSession,
        hash: &TxHash,
        expected: FeeStatus,
    ) -> Result<(), StoreError> {
        let stored = self
            .coll::<Ticket>()
            .find_one_with_session(doc! {"_id": *hash}, None, session)
            .await?
            .ok_or(StoreError::TicketNotFound(*hash))?;
        if stored.fee_status != expected {
            return Err(StoreError::Conflict {
                hash: *hash,
                expected,
            });
        }
        Ok(())
    }

    async fn insert_ticket_tx(
        &self,
        session: &mut ClientSession,
        ticket: &Ticket,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        self.check_stamp(session, stamp).await?;
        match self
            .coll::<Ticket>()
            .insert_one_with_session(ticket, None, session)
            .await
        {
            Err(e) if is_duplicate_key_error(&e) => {
                return Err(StoreError::TicketExists(ticket.hash))
            }
            other => other?,
        };
        self.record_stamp(session, stamp).await
    }

    async fn update_ticket_tx(
        &self,
        session: &mut ClientSession,
        ticket: &Ticket,
        expected: FeeStatus,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        self.check_status(session, &ticket.hash, expected).await?;
        self.check_stamp(session, stamp).await?;
        self.coll::<Ticket>()
            .replace_one_with_session(doc! {"_id": ticket.hash}, ticket, None, session)
            .await?;
        self.record_stamp(session, stamp).await
    }

    async fn set_vote_choices_tx(
        &self,
        session: &mut ClientSession,
        ticket: &Ticket,
        expected: FeeStatus,
        record: &VoteChangeRecord,
        max_records: usize,
        stamp: &RequestStamp,
    ) -> Result<(), StoreError> {
        self.check_status(session, &ticket.hash, expected).await?;
        self.check_stamp(session, Some(stamp)).await?;
        self.coll::<Ticket>()
            .replace_one_with_session(doc! {"_id": ticket.hash}, ticket, None, session)
            .await?;

        let records = self.coll::<VoteChangeRecord>();
        records
            .insert_one_with_session(record, None, session)
            .await?;
        let filter = doc! {"ticket_hash": ticket.hash};
        let count = records
            .count_documents_with_session(filter.clone(), None, session)
            .await? as usize;
        if count > max_records {
            // Prune the oldest records beyond the bound.
            let raw = self
                .db
                .collection::<Document>(VoteChangeRecord::NAME);
            let options = FindOptions::builder()
                .sort(doc! {"_id": 1})
                .limit((count - max_records) as i64)
                .projection(doc! {"_id": 1})
                .build();
            let mut cursor = raw.find_with_session(filter, options, session).await?;
            let oldest: Vec<Document> = cursor.stream(session).try_collect().await?;
            let ids: Vec<Bson> = oldest
                .into_iter()
                .filter_map(|d| d.get("_id").cloned())
                .collect();
            raw.delete_many_with_session(doc! {"_id": {"$in": ids}}, None, session)
                .await?;
        }
        self.record_stamp(session, Some(stamp)).await
    }

    async fn insert_alt_sign_addr_tx(
        &self,
        session: &mut ClientSession,
        data: &AltSignAddrData,
        max_records: usize,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let history = self.coll::<AltSignAddrData>();
        let count = history
            .count_documents_with_session(doc! {"ticket_hash": data.ticket_hash}, None, session)
            .await? as usize;
        if count >= max_records {
            return Err(StoreError::HistoryFull(data.ticket_hash));
        }
        self.check_stamp(session, stamp).await?;
        history.insert_one_with_session(data, None, session).await?;
        self.record_stamp(session, stamp).await
    }

    async fn oldest_first<T>(&self, coll: Coll<T>, hash: &TxHash) -> Result<Vec<T>, StoreError>
    where
        T: MongoCollection + serde::de::DeserializeOwned + Unpin + Send + Sync,
    {
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        let cursor = coll.find(doc! {"ticket_hash": *hash}, options).await?;
        Ok(cursor.try_collect().await?)
    }
}

#[rocket::async_trait]
impl TicketStore for MongoStore {
    async fn ticket(&self, hash: &TxHash) -> Result<Option<Ticket>, StoreError> {
        Ok(self
            .coll::<Ticket>()
            .find_one(doc! {"_id": *hash}, None)
            .await?)
    }

    async fn insert_ticket(
        &self,
        ticket: &Ticket,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let result = self.insert_ticket_tx(&mut session, ticket, stamp).await;
        Self::finish(session, result).await
    }

    async fn update_ticket(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let result = self
            .update_ticket_tx(&mut session, ticket, expected, stamp)
            .await;
        Self::finish(session, result).await
    }

    async fn set_vote_choices(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        record: &VoteChangeRecord,
        max_records: usize,
        stamp: &RequestStamp,
    ) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let result = self
            .set_vote_choices_tx(&mut session, ticket, expected, record, max_records, stamp)
            .await;
        Self::finish(session, result).await
    }

    async fn vote_changes(&self, hash: &TxHash) -> Result<Vec<VoteChangeRecord>, StoreError> {
        self.oldest_first(self.coll(), hash).await
    }

    async fn alt_sign_addr_history(
        &self,
        hash: &TxHash,
    ) -> Result<Vec<AltSignAddrData>, StoreError> {
        self.oldest_first(self.coll(), hash).await
    }

    async fn insert_alt_sign_addr(
        &self,
        data: &AltSignAddrData,
        max_records: usize,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let result = self
            .insert_alt_sign_addr_tx(&mut session, data, max_records, stamp)
            .await;
        Self::finish(session, result).await
    }

    async fn last_timestamp(
        &self,
        hash: &TxHash,
        action: Action,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .coll::<StampDoc>()
            .find_one(doc! {"_id": stamp_id(hash, action)}, None)
            .await?
            .map(|s| s.timestamp))
    }

    async fn record_timestamp(&self, stamp: &RequestStamp) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let result = match self.check_stamp(&mut session, Some(stamp)).await {
            Ok(()) => self.record_stamp(&mut session, Some(stamp)).await,
            Err(e) => Err(e),
        };
        Self::finish(session, result).await
    }

    async fn tickets_with_status(
        &self,
        statuses: &[FeeStatus],
    ) -> Result<Vec<Ticket>, StoreError> {
        let statuses: Vec<Bson> = statuses.iter().map(|s| Bson::from(*s)).collect();
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        let cursor = self
            .coll::<Ticket>()
            .find(doc! {"fee_status": {"$in": statuses}}, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count_by_status(&self) -> Result<HashMap<FeeStatus, u64>, StoreError> {
        use FeeStatus::*;
        let mut counts = HashMap::new();
        for status in [
            NoFee,
            Received,
            Broadcast,
            Confirmed,
            Expired,
            BroadcastFailed,
            UnknownOutputs,
        ] {
            let count = self
                .coll::<Ticket>()
                .count_documents(doc! {"fee_status": status}, None)
                .await?;
            if count > 0 {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }
}
