//! Quorum piece transport
//!
//! Uploads the n shares of a segment to n nodes concurrently and succeeds
//! once enough of them are stored; downloads race all pieces and keep the
//! first k that verify.
//!
//! Upload thresholds:
//! - stop waiting once `o` pieces are stored, plus a short grace period
//! - fail with `UnderThreshold` if fewer than `m` are stored
//!
//! Upload memory is bounded by a byte budget. Producers take a
//! [`BudgetReservation`] before buffering a segment and hold it until the
//! segment's pieces are sent, so reading blocks while the budget is spent.

use crate::error::{PieceError, PieceResult};
use crate::node::{Authorization, NodeEndpoint, NodeLookup};
use crate::pool::ConnectionPool;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uplink_core::metrics::names;
use uplink_core::{
    MetricsCollector, NodeId, NoopMetrics, OpContext, PieceId, PieceLocation, RedundancyScheme,
    Result, Share, TransportConfig, UplinkError,
};

/// Shares of one segment to place on storage nodes
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub root_piece_id: PieceId,
    pub shares: Vec<Share>,
    pub scheme: RedundancyScheme,
    pub expiration: Option<DateTime<Utc>>,
}

/// Stored pieces of a successful upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Ordered by piece number
    pub pieces: Vec<PieceLocation>,
    /// Fewer than `o` pieces stored
    pub under_replicated: bool,
}

/// Share of the upload memory budget, returned on drop
#[derive(Debug)]
pub struct BudgetReservation {
    _permit: OwnedSemaphorePermit,
    bytes: usize,
}

impl BudgetReservation {
    /// Bytes actually reserved (requests are capped at the whole budget)
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Moves pieces between the uplink and storage nodes
pub struct PieceTransport {
    lookup: Arc<dyn NodeLookup>,
    pool: Arc<ConnectionPool>,
    authorization: Authorization,
    config: TransportConfig,

    /// Bytes of segment data producers may buffer
    budget: Arc<Semaphore>,
    budget_bytes: usize,

    metrics: Arc<dyn MetricsCollector>,
}

impl PieceTransport {
    pub fn new(
        lookup: Arc<dyn NodeLookup>,
        pool: Arc<ConnectionPool>,
        config: TransportConfig,
        max_buffer_mem: usize,
    ) -> Self {
        let budget_bytes = max_buffer_mem.clamp(1, u32::MAX as usize);
        Self {
            lookup,
            pool,
            authorization: Authorization::default(),
            config,
            budget: Arc::new(Semaphore::new(budget_bytes)),
            budget_bytes,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Unused part of the upload memory budget
    pub fn available_budget(&self) -> usize {
        self.budget.available_permits()
    }

    /// Wait until `bytes` of the upload budget are free and reserve them.
    ///
    /// A request larger than the whole budget reserves all of it, so such
    /// segments are buffered one at a time.
    pub async fn reserve(&self, ctx: &OpContext, bytes: usize) -> Result<BudgetReservation> {
        let bytes = bytes.clamp(1, self.budget_bytes);
        let budget = self.budget.clone();
        let permit = ctx
            .run(async move {
                budget
                    .acquire_many_owned(bytes as u32)
                    .await
                    .map_err(|_| UplinkError::Internal("upload budget closed".to_string()))
            })
            .await?;
        if self.budget.available_permits() == 0 {
            debug!(reserved = bytes, "Upload budget exhausted");
        }
        Ok(BudgetReservation {
            _permit: permit,
            bytes,
        })
    }

    /// Upload the shares of one segment
    #[instrument(skip_all, fields(root = %request.root_piece_id, shares = request.shares.len()))]
    pub async fn upload(&self, ctx: &OpContext, request: UploadRequest) -> Result<UploadOutcome> {
        ctx.check()?;
        let UploadRequest {
            root_piece_id,
            shares,
            scheme,
            expiration,
        } = request;
        scheme.validate()?;
        if shares.len() != scheme.total_shares {
            return Err(UplinkError::ErasureCoding(format!(
                "expected {} shares, got {}",
                scheme.total_shares,
                shares.len()
            )));
        }

        let candidates = ctx
            .run(async {
                self.lookup
                    .find_storage_nodes(shares.len(), &[])
                    .await
                    .map_err(UplinkError::from)
            })
            .await?;

        if candidates.len() < scheme.repair_shares {
            warn!(
                available = candidates.len(),
                required = scheme.repair_shares,
                "Not enough storage nodes"
            );
            return Err(UplinkError::NotEnoughNodes {
                available: candidates.len(),
                required: scheme.repair_shares,
            });
        }

        let start = Instant::now();
        let used: Mutex<HashSet<NodeId>> = Mutex::new(candidates.iter().map(|c| c.id).collect());
        let mut candidates = candidates.into_iter();

        // Dropping the group aborts every piece still in flight
        let mut group: FuturesUnordered<_> = shares
            .into_iter()
            .map(|share| {
                let first = candidates.next();
                self.upload_piece(root_piece_id, share, first, &used, expiration)
            })
            .collect();

        let deadline = tokio::time::sleep(self.config.upload_timeout);
        tokio::pin!(deadline);
        let long_tail = tokio::time::sleep(self.config.upload_timeout);
        tokio::pin!(long_tail);
        let mut tail_armed = false;

        let mut pieces = Vec::with_capacity(scheme.total_shares);
        let mut failed = 0usize;
        let mut interrupted = None;

        loop {
            tokio::select! {
                biased;
                err = ctx.done() => {
                    interrupted = Some(err);
                    break;
                }
                _ = &mut deadline => {
                    warn!(stored = pieces.len(), "Upload deadline reached");
                    break;
                }
                _ = &mut long_tail, if tail_armed => {
                    break;
                }
                next = group.next() => match next {
                    Some(Ok(location)) => {
                        pieces.push(location);
                        if pieces.len() == scheme.optimal_shares {
                            long_tail
                                .as_mut()
                                .reset(tokio::time::Instant::now() + self.config.long_tail_grace);
                            tail_armed = true;
                        }
                    }
                    Some(Err(err)) => {
                        failed += 1;
                        debug!(error = %err, "Piece upload gave up");
                    }
                    None => break,
                },
            }
        }

        let abandoned = group.len();
        drop(group);
        if tail_armed && abandoned > 0 {
            debug!(abandoned, "Cancelled long-tail uploads");
            self.metrics
                .increment(names::LONG_TAIL_CANCELLED, abandoned as u64);
        }
        pieces.sort_by_key(|p| p.piece_num);

        if let Some(err) = interrupted {
            self.cleanup(root_piece_id, &pieces).await;
            return Err(err);
        }

        if pieces.len() < scheme.repair_shares {
            warn!(
                stored = pieces.len(),
                required = scheme.repair_shares,
                failed,
                "Upload under threshold"
            );
            self.cleanup(root_piece_id, &pieces).await;
            return Err(UplinkError::UnderThreshold {
                achieved: pieces.len(),
                required: scheme.repair_shares,
            });
        }

        let under_replicated = pieces.len() < scheme.optimal_shares;
        info!(
            stored = pieces.len(),
            failed,
            under_replicated,
            latency_ms = start.elapsed().as_millis() as u64,
            "Segment pieces uploaded"
        );

        Ok(UploadOutcome {
            pieces,
            under_replicated,
        })
    }

    /// Fetch the first k pieces that verify
    #[instrument(skip_all, fields(root = %root_piece_id, pieces = locations.len()))]
    pub async fn download(
        &self,
        ctx: &OpContext,
        root_piece_id: PieceId,
        locations: &[PieceLocation],
        scheme: &RedundancyScheme,
    ) -> Result<Vec<Share>> {
        ctx.check()?;
        let required = scheme.required_shares;

        let mut seen = HashSet::new();
        let mut group: FuturesUnordered<_> = locations
            .iter()
            .filter(|l| seen.insert(l.piece_num))
            .map(|l| self.download_piece(root_piece_id, l))
            .collect();

        let deadline = tokio::time::sleep(self.config.download_timeout);
        tokio::pin!(deadline);

        let mut shares = Vec::with_capacity(required);
        loop {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = &mut deadline => {
                    warn!(received = shares.len(), required, "Download deadline reached");
                    break;
                }
                next = group.next() => match next {
                    Some(Ok(share)) => {
                        shares.push(share);
                        if shares.len() >= required {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        self.metrics.increment(names::PIECE_DOWNLOAD_FAILURES, 1);
                        warn!(error = %err, "Piece download failed");
                    }
                    None => break,
                },
            }
        }
        drop(group);

        if shares.len() < required {
            return Err(UplinkError::InsufficientPieces {
                got: shares.len(),
                required,
            });
        }

        shares.sort_by_key(|s| s.index);
        debug!(received = shares.len(), "Segment pieces downloaded");
        Ok(shares)
    }

    /// Best-effort concurrent delete; returns how many pieces were removed
    #[instrument(skip_all, fields(root = %root_piece_id, pieces = locations.len()))]
    pub async fn delete(
        &self,
        ctx: &OpContext,
        root_piece_id: PieceId,
        locations: &[PieceLocation],
    ) -> usize {
        if locations.is_empty() {
            return 0;
        }

        let deletes = join_all(
            locations
                .iter()
                .map(|l| self.delete_piece(root_piece_id, l)),
        );
        let results = tokio::select! {
            biased;
            err = ctx.done() => {
                warn!(error = %err, "Piece deletion interrupted");
                return 0;
            }
            results = deletes => results,
        };

        let mut deleted = 0;
        for (location, result) in locations.iter().zip(results) {
            match result {
                Ok(()) => deleted += 1,
                Err(err) => {
                    self.metrics.increment(names::PIECE_DELETE_FAILURES, 1);
                    warn!(
                        piece = location.piece_num,
                        node = %location.node_id,
                        error = %err,
                        "Piece delete failed"
                    );
                }
            }
        }

        self.metrics.increment(names::PIECES_DELETED, deleted as u64);
        debug!(deleted, total = locations.len(), "Deleted pieces");
        deleted
    }

    /// Store one share, moving to alternate nodes on failure
    async fn upload_piece(
        &self,
        root_piece_id: PieceId,
        share: Share,
        first: Option<NodeEndpoint>,
        used: &Mutex<HashSet<NodeId>>,
        expiration: Option<DateTime<Utc>>,
    ) -> PieceResult<PieceLocation> {
        let piece_id = root_piece_id.derive(share.index);
        let mut next = first;
        let mut last_error = PieceError::Lookup("no storage node available".to_string());

        for attempt in 0..=self.config.max_retries {
            let endpoint = match next.take() {
                Some(endpoint) => endpoint,
                None => match self.alternate(used).await {
                    Some(endpoint) => endpoint,
                    None => break,
                },
            };

            match self.try_upload(&endpoint, piece_id, &share, expiration).await {
                Ok(location) => {
                    self.metrics.increment(names::PIECES_UPLOADED, 1);
                    return Ok(location);
                }
                Err(err) => {
                    self.metrics.increment(names::PIECE_UPLOAD_FAILURES, 1);
                    warn!(
                        piece = share.index,
                        node = %endpoint.id,
                        attempt,
                        error = %err,
                        "Piece upload failed"
                    );
                    if err.is_connection_error() {
                        self.pool.invalidate(&endpoint.id).await;
                    }
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn try_upload(
        &self,
        endpoint: &NodeEndpoint,
        piece_id: PieceId,
        share: &Share,
        expiration: Option<DateTime<Utc>>,
    ) -> PieceResult<PieceLocation> {
        let conn = self.pool.get(endpoint).await?;
        let ack = timeout(
            self.config.piece_timeout,
            conn.upload(piece_id, &self.authorization, share.data.clone(), expiration),
        )
        .await
        .map_err(|_| PieceError::Timeout)??;

        if ack.hash != share.hash {
            return Err(PieceError::HashMismatch(format!(
                "node {} acknowledged {} for piece {}",
                endpoint.id, ack.hash, share.index
            )));
        }

        Ok(PieceLocation {
            piece_num: share.index,
            node_id: endpoint.id,
            size: share.size() as u64,
            hash: share.hash,
        })
    }

    /// A node not yet used by any piece of this segment
    async fn alternate(&self, used: &Mutex<HashSet<NodeId>>) -> Option<NodeEndpoint> {
        loop {
            let excluded: Vec<NodeId> = used.lock().iter().copied().collect();
            let found = match self.lookup.find_storage_nodes(1, &excluded).await {
                Ok(found) => found,
                Err(err) => {
                    debug!(error = %err, "Alternate node lookup failed");
                    return None;
                }
            };
            let endpoint = found.into_iter().next()?;
            if excluded.contains(&endpoint.id) {
                return None;
            }
            if used.lock().insert(endpoint.id) {
                return Some(endpoint);
            }
        }
    }

    async fn download_piece(
        &self,
        root_piece_id: PieceId,
        location: &PieceLocation,
    ) -> PieceResult<Share> {
        let endpoint = self.lookup.resolve(&location.node_id).await?;
        let conn = self.pool.get(&endpoint).await?;
        let piece_id = root_piece_id.derive(location.piece_num);

        let fetched = timeout(
            self.config.piece_timeout,
            conn.download(piece_id, &self.authorization),
        )
        .await
        .map_err(|_| PieceError::Timeout)
        .and_then(|r| r);
        let data = match fetched {
            Ok(data) => data,
            Err(err) => {
                if err.is_connection_error() {
                    self.pool.invalidate(&endpoint.id).await;
                }
                return Err(err);
            }
        };

        if data.len() as u64 != location.size {
            return Err(PieceError::SizeMismatch {
                expected: location.size,
                actual: data.len() as u64,
            });
        }

        let share = Share::new(location.piece_num, data);
        if share.hash != location.hash {
            return Err(PieceError::HashMismatch(format!(
                "piece {} from node {}",
                location.piece_num, location.node_id
            )));
        }

        self.metrics.increment(names::PIECES_DOWNLOADED, 1);
        Ok(share)
    }

    async fn delete_piece(&self, root_piece_id: PieceId, location: &PieceLocation) -> PieceResult<()> {
        let endpoint = self.lookup.resolve(&location.node_id).await?;
        let conn = self.pool.get(&endpoint).await?;
        timeout(
            self.config.piece_timeout,
            conn.delete(root_piece_id.derive(location.piece_num), &self.authorization),
        )
        .await
        .map_err(|_| PieceError::Timeout)?
    }

    /// Remove the pieces of an abandoned upload, with a fresh context
    async fn cleanup(&self, root_piece_id: PieceId, pieces: &[PieceLocation]) {
        if pieces.is_empty() {
            return;
        }
        let cleanup = OpContext::with_timeout(self.config.cleanup_timeout);
        let deleted = self.delete(&cleanup, root_piece_id, pieces).await;
        if deleted < pieces.len() {
            self.metrics
                .increment(names::CLEANUP_FAILURES, (pieces.len() - deleted) as u64);
        }
    }
}
