//! Orchestrator: wires the rate arbiter, client pool, pager, reconciler,
//! scheduler, producer pool, downloader pool, and failure dumper together
//! under a single cancellable context, expands the CLI's account/list/
//! following targets into a depth-ordered heap, runs the download pipeline,
//! and carries out the post-run retry pass over the [`FailureDumper`].
//!
//! Teardown follows a channel-close cascade: the heap is fully built before
//! dispatch starts (so there is no separate entity-source channel to close)
//! `→ scheduler drains heap → producers finish → close media-channel →
//! downloaders drain → close error-channel → orchestrator drains
//! error-channel → returns`.

use crate::cli::{Cli, UserRef};
use crate::db::Db;
use crate::downloader;
use crate::dumper::FailureDumper;
use crate::model::{Account, Entity, FailedItem, List, RemoteProfile};
use crate::producer::{self, MediaEnvelope};
use crate::reconciler::{self, ReconcileError};
use crate::remote::pager::{PageBounds, TimelinePager};
use crate::remote::types::TimelineItem;
use crate::remote::{parse_list, parse_profile, ClientPool};
use crate::scheduler::{self, ScheduleEntry, ScheduleHeap};
use crate::session::Session;
use crate::AppError;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PROFILE_BY_ID_PATH: &str = "/i/api/graphql/UserByRestId";
const PROFILE_BY_HANDLE_PATH: &str = "/i/api/graphql/UserByScreenName";
const LIST_LOOKUP_PATH: &str = "/i/api/graphql/ListByRestId";
const LIST_MEMBERS_PATH: &str = "/i/api/graphql/ListMembers";
const FOLLOWING_PATH: &str = "/i/api/graphql/Following";

const MEDIA_CHANNEL_CAPACITY: usize = 256;
const FAILURE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("dumper error: {0}")]
    Dumper(#[from] crate::dumper::DumperError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve every usable client identity for the run")]
    NoUsableClient,
    #[error("run cancelled before it could complete")]
    Cancelled,
    #[error("a critical database write failed mid-run; the run cannot report success")]
    PersistenceFailure,
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Run(e.to_string())
    }
}

/// Owns the cancellable context and the shared [`Session`] for one run.
pub struct Orchestrator {
    pub session: Arc<Session>,
    root_path: PathBuf,
    cancel: CancellationToken,
    auto_follow: bool,
    no_retry: bool,
    /// Set when a producer hit an unrecoverable persistence failure (spec
    /// §7: "DB write failure on critical update... program must not report
    /// success"). Distinct from `cancel`, which is also set by a plain
    /// signal shutdown that *does* exit 0 once the dump completes.
    fatal: Arc<std::sync::atomic::AtomicBool>,
}

impl Orchestrator {
    pub fn new(session: Arc<Session>, root_path: PathBuf, auto_follow: bool, no_retry: bool) -> Self {
        Self {
            session,
            root_path,
            cancel: CancellationToken::new(),
            auto_follow,
            no_retry,
            fatal: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn users_dir(&self) -> PathBuf {
        self.root_path.join("users")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root_path.join(".data")
    }

    pub fn dumper_path(&self) -> PathBuf {
        self.data_dir().join("errors.json")
    }

    /// Register OS signal handlers (interrupt/terminate/hangup/quit); on the
    /// first one observed, cancel this run's context. Spawns a background
    /// task and returns immediately.
    pub fn spawn_signal_handler(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, cancelling run");
            cancel.cancel();
        });
    }

    /// Run one full pass: resolve targets, reconcile entities, page media
    /// through the scheduler/producer/downloader pipeline, then run the
    /// retry pass and persist the failure dumper.
    pub async fn run(&self, cli: &Cli) -> Result<(), OrchestratorError> {
        std::fs::create_dir_all(self.data_dir())?;

        let mut dumper = FailureDumper::new();
        dumper.load(&self.dumper_path())?;

        let heap = self.build_heap(cli).await?;
        let failures = self.run_pipeline(heap).await;
        for failed in failures {
            dumper.push_failed(failed);
        }

        if !self.cancel.is_cancelled() && !self.no_retry {
            self.run_retry_pass(&mut dumper).await;
        }

        dumper.dump(&self.dumper_path())?;

        if cli.dbg {
            self.session.clients.counters.log_summary();
        }

        if self.fatal.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(OrchestratorError::PersistenceFailure);
        }
        Ok(())
    }

    /// Resolve every CLI target (`-user`, `-list`, `-foll`) into reconciled
    /// entities with an estimated depth, deduplicating repeat encounters of
    /// the same account via the [`Session`]'s claim maps.
    async fn build_heap(&self, cli: &Cli) -> Result<ScheduleHeap, OrchestratorError> {
        let mut heap = ScheduleHeap::new();
        let users_dir = self.users_dir();

        for user_ref in &cli.users {
            if let Some(entry) = self.resolve_direct_account(user_ref, &users_dir).await? {
                heap.push(entry);
            }
        }

        for &list_id in &cli.lists {
            self.expand_list(list_id, &mut heap).await?;
        }

        for user_ref in &cli.foll {
            self.expand_following(user_ref, &mut heap).await?;
        }

        Ok(heap)
    }

    /// Resolve a single `-user` target into a [`ScheduleEntry`], skipping it
    /// if another target already claimed this account this run.
    async fn resolve_direct_account(
        &self,
        user_ref: &UserRef,
        parent_dir: &PathBuf,
    ) -> Result<Option<ScheduleEntry>, OrchestratorError> {
        let profile = match self.lookup_profile(user_ref).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to resolve account profile, skipping");
                return Ok(None);
            }
        };
        if !self.session.claim_account(profile.account.id) {
            return Ok(None);
        }
        if self.auto_follow && profile.account.protected {
            self.issue_follow_request(&profile.account).await;
        }
        Ok(Some(self.reconcile_and_schedule(profile, parent_dir).await?))
    }

    /// Look up one account's profile by id or handle, the source of the
    /// depth scheduler's `remote_media_count` input, via a direct
    /// (non-paged) GET gated by the same arbiter/client-pool machinery as
    /// the timeline endpoints.
    async fn lookup_profile(&self, user_ref: &UserRef) -> Result<RemoteProfile, OrchestratorError> {
        let (path, url) = match user_ref {
            UserRef::Id(id) => (PROFILE_BY_ID_PATH, format!("https://api.x.com{PROFILE_BY_ID_PATH}?variables=id-{id}")),
            UserRef::Handle(handle) => {
                (PROFILE_BY_HANDLE_PATH, format!("https://api.x.com{PROFILE_BY_HANDLE_PATH}?variables=screen_name-{handle}"))
            }
        };

        let client = self
            .session
            .clients
            .select(&self.cancel, path)
            .await
            .map_err(|_| OrchestratorError::NoUsableClient)?;
        let (body, _headers) = self
            .session
            .clients
            .get(&self.cancel, &client, &url, path)
            .await
            .map_err(|_| OrchestratorError::NoUsableClient)?;
        parse_profile(&body).ok_or(OrchestratorError::NoUsableClient)
    }

    /// Reconcile a resolved profile into an [`Entity`] and a [`ScheduleEntry`],
    /// persisting the account row (and any rename history) first.
    async fn reconcile_and_schedule(
        &self,
        profile: RemoteProfile,
        parent_dir: &PathBuf,
    ) -> Result<ScheduleEntry, OrchestratorError> {
        self.session.db.upsert_account(&profile.account).await?;
        let entity = reconciler::reconcile_account(
            &self.session.db,
            profile.account.id,
            parent_dir,
            &profile.account.display_name,
            &profile.account.handle,
        )
        .await?;
        let local_media_count = self
            .session
            .db
            .get_account_entity(entity.id.unwrap_or_default())
            .await?
            .map(|row| row.media_count)
            .unwrap_or(0);
        let depth = scheduler::estimate_depth(local_media_count, profile.media_count);
        let priority = profile.account.protected && profile.followed_by_caller;
        Ok(ScheduleEntry { entity, depth, priority })
    }

    /// Expand a `-list` target: reconcile the list's own directory, then
    /// page its membership, reconciling each member's account and the
    /// symlink that records their membership.
    async fn expand_list(&self, list_id: i64, heap: &mut ScheduleHeap) -> Result<(), OrchestratorError> {
        let list = match self.lookup_list(list_id).await {
            Ok(l) => l,
            Err(e) => {
                warn!(list_id, error = %e, "failed to resolve list, skipping");
                return Ok(());
            }
        };
        self.session.db.upsert_list(&list).await?;
        let list_entity =
            reconciler::reconcile_list(&self.session.db, list.id, &self.root_path, &list.name).await?;

        let url = format!("https://api.x.com{LIST_MEMBERS_PATH}?variables=list-{list_id}");
        self.page_and_link_members(list_entity, url, LIST_MEMBERS_PATH, heap).await
    }

    /// Expand a `-foll` target: resolve the owning account, synthesize a
    /// list-like directory for its friends ("following") list, and page its
    /// membership the same way as a real list.
    async fn expand_following(&self, user_ref: &UserRef, heap: &mut ScheduleHeap) -> Result<(), OrchestratorError> {
        let owner = match self.lookup_profile(user_ref).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to resolve -foll owner, skipping");
                return Ok(());
            }
        };
        self.session.db.upsert_account(&owner.account).await?;

        let synthetic_name = format!("{}'s Following", owner.account.handle);
        let synthetic = List { id: owner.account.id, name: synthetic_name, owner_account_id: owner.account.id };
        self.session.db.upsert_list(&synthetic).await?;
        let list_entity =
            reconciler::reconcile_list(&self.session.db, synthetic.id, &self.root_path, &synthetic.name).await?;

        let url = format!("https://api.x.com{FOLLOWING_PATH}?variables=id-{}", owner.account.id);
        self.page_and_link_members(list_entity, url, FOLLOWING_PATH, heap).await
    }

    async fn page_and_link_members(
        &self,
        list_entity: Entity,
        url: String,
        path: &str,
        heap: &mut ScheduleHeap,
    ) -> Result<(), OrchestratorError> {
        let client = match self.session.clients.select(&self.cancel, path).await {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let bounds = PageBounds { min: None, max: Utc::now().naive_utc() };
        let mut pager = TimelinePager::new(&self.session.clients, &client, url, path, bounds);

        loop {
            let page = match pager.next_page(&self.cancel).await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to page list/following membership");
                    break;
                }
            };
            for item in page {
                let TimelineItem::Member(member) = item else { continue };
                if !self.session.claim_list_membership(member.id, list_entity.subject_id) {
                    continue;
                }
                let remote_media_count = member.media_count;
                let account = Account {
                    id: member.id,
                    handle: member.handle,
                    display_name: member.display_name,
                    protected: member.protected,
                    friends_count: member.friends_count,
                };
                self.session.db.upsert_account(&account).await?;
                let account_entity = match reconciler::reconcile_account(
                    &self.session.db,
                    account.id,
                    &self.users_dir(),
                    &account.display_name,
                    &account.handle,
                )
                .await
                {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(account_id = account.id, error = %e, "failed to reconcile list member, skipping");
                        continue;
                    }
                };

                if let Some(list_entity_id) = list_entity.id {
                    if let Err(e) = reconciler::reconcile_link(
                        &self.session.db,
                        account.id,
                        list_entity_id,
                        &list_entity.path(),
                        &account_entity.name,
                    )
                    .await
                    {
                        warn!(account_id = account.id, error = %e, "failed to reconcile link");
                    }
                }

                if self.session.claim_account(account.id) {
                    let local_media_count = self
                        .session
                        .db
                        .get_account_entity(account_entity.id.unwrap_or_default())
                        .await?
                        .map(|row| row.media_count)
                        .unwrap_or(0);
                    let depth = scheduler::estimate_depth(local_media_count, remote_media_count);
                    heap.push(ScheduleEntry { entity: account_entity, depth, priority: false });
                }
            }
        }
        Ok(())
    }

    async fn lookup_list(&self, list_id: i64) -> Result<List, OrchestratorError> {
        let url = format!("https://api.x.com{LIST_LOOKUP_PATH}?variables=id-{list_id}");
        let client = self
            .session
            .clients
            .select(&self.cancel, LIST_LOOKUP_PATH)
            .await
            .map_err(|_| OrchestratorError::NoUsableClient)?;
        let (body, _headers) = self
            .session
            .clients
            .get(&self.cancel, &client, &url, LIST_LOOKUP_PATH)
            .await
            .map_err(|_| OrchestratorError::NoUsableClient)?;
        parse_list(&body).ok_or(OrchestratorError::NoUsableClient)
    }

    /// Best-effort follow request for a protected account under `-auto-follow`.
    /// This crate does not model the remote write surface beyond this one
    /// call; failures here never affect the run's outcome.
    async fn issue_follow_request(&self, account: &Account) {
        const FOLLOW_PATH: &str = "/1.1/friendships/create.json";
        let url = format!("https://api.x.com{FOLLOW_PATH}?user_id={}", account.id);
        if let Ok(client) = self.session.clients.select(&self.cancel, FOLLOW_PATH).await {
            if let Err(e) = self.session.clients.get(&self.cancel, &client, &url, FOLLOW_PATH).await {
                warn!(account_id = account.id, error = %e, "auto-follow request failed");
            }
        }
    }

    /// Run the scheduler/producer/downloader pipeline to completion over
    /// `heap`, returning every [`FailedItem`] collected from the error
    /// channel once the close cascade finishes.
    async fn run_pipeline(&self, heap: ScheduleHeap) -> Vec<FailedItem> {
        if heap.is_empty() {
            return Vec::new();
        }

        let (media_tx, media_rx) = mpsc::channel::<MediaEnvelope>(MEDIA_CHANNEL_CAPACITY);
        let (fail_tx, mut fail_rx) = mpsc::channel::<FailedItem>(FAILURE_CHANNEL_CAPACITY);

        let worker_count = downloader::default_worker_count();
        let http = reqwest::Client::new();
        let downloader_cancel = self.cancel.clone();
        let downloader_task = tokio::spawn(downloader::run_pool(
            worker_count,
            http,
            media_rx,
            fail_tx.clone(),
            downloader_cancel,
        ));
        drop(fail_tx);

        let clients = self.session.clients.clone();
        let db = self.session.db.clone();
        let cancel = self.cancel.clone();
        let fatal = self.fatal.clone();
        let cap = scheduler::DEFAULT_CAP;
        let bound = scheduler::PRODUCER_MAX_CONCURRENT;

        scheduler::dispatch(heap, cap, bound, &cancel, move |entry| {
            let clients = clients.clone();
            let db = db.clone();
            let media_tx = media_tx.clone();
            let cancel = cancel.clone();
            let fatal = fatal.clone();
            async move {
                let now = Utc::now().naive_utc();
                producer::run_entity(entry, &clients, &db, &media_tx, now, &cancel, &fatal).await
            }
        })
        .await;

        let _ = downloader_task.await;

        let mut collected = Vec::new();
        while let Some(failed) = fail_rx.recv().await {
            collected.push(failed);
        }
        collected
    }

    /// Re-dispatch the dumper's contents through the downloader pool
    /// directly, bypassing the producer/scheduler. Items that succeed are
    /// not re-added; items that fail again are pushed back.
    async fn run_retry_pass(&self, dumper: &mut FailureDumper) {
        let items = match dumper.total(&self.session.db).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to load dumper contents for retry pass");
                return;
            }
        };
        if items.is_empty() {
            return;
        }
        dumper.clear();

        let (media_tx, media_rx) = mpsc::channel::<MediaEnvelope>(items.len().max(1));
        let (fail_tx, mut fail_rx) = mpsc::channel::<FailedItem>(FAILURE_CHANNEL_CAPACITY);

        for (post, entity) in items {
            if media_tx.send(MediaEnvelope { entity, post }).await.is_err() {
                break;
            }
        }
        drop(media_tx);

        let worker_count = downloader::default_worker_count();
        let http = reqwest::Client::new();
        let cancel = self.cancel.clone();
        downloader::run_pool(worker_count, http, media_rx, fail_tx.clone(), cancel).await;
        drop(fail_tx);

        while let Some(failed) = fail_rx.recv().await {
            dumper.push_failed(failed);
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
        _ = hangup.recv() => info!("received SIGHUP"),
        _ = quit.recv() => info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::RateArbiter;
    use crate::clock::MonotonicClock;

    async fn orchestrator(root: PathBuf) -> Orchestrator {
        let db = Db::connect_in_memory().await.unwrap();
        let arbiter = Arc::new(RateArbiter::new(Arc::new(MonotonicClock::default())));
        let clients = Arc::new(ClientPool::new(Vec::new(), arbiter.clone()));
        let session = Arc::new(Session::new(db, clients, arbiter));
        Orchestrator::new(session, root, false, false)
    }

    #[tokio::test]
    async fn run_with_no_targets_completes_and_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path().to_path_buf()).await;
        let cli = Cli { users: vec![], lists: vec![], foll: vec![], conf: false, dbg: false, auto_follow: false, no_retry: false };

        orch.run(&cli).await.unwrap();
        assert!(orch.dumper_path().exists());
    }

    #[tokio::test]
    async fn path_helpers_are_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path().to_path_buf()).await;
        assert_eq!(orch.users_dir(), dir.path().join("users"));
        assert_eq!(orch.data_dir(), dir.path().join(".data"));
        assert_eq!(orch.dumper_path(), dir.path().join(".data").join("errors.json"));
    }

    #[tokio::test]
    async fn build_heap_with_no_clients_skips_unreachable_targets() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path().to_path_buf()).await;
        let cli = Cli {
            users: vec![UserRef::Id(42)],
            lists: vec![],
            foll: vec![],
            conf: false,
            dbg: false,
            auto_follow: false,
            no_retry: false,
        };

        let heap = orch.build_heap(&cli).await.unwrap();
        assert!(heap.is_empty());
    }

    #[tokio::test]
    async fn cancellation_token_starts_uncancelled() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path().to_path_buf()).await;
        assert!(!orch.cancellation_token().is_cancelled());
        orch.cancellation_token().cancel();
        assert!(orch.cancellation_token().is_cancelled());
    }
}
