use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::bail;
use crate::destination::{Destination, DestinationTransaction};
use crate::error::{CdcResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;
use crate::types::RowImage;

/// Failure injected by a [`FaultyDestination`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Starting a transaction fails as if the target were unreachable.
    Begin,
    /// Committing fails as if the target were unreachable.
    Commit,
    /// The write at this zero-based position of every transaction fails to apply.
    ApplyAt(usize),
    /// Every write whose row image has `column` set to `value` fails to apply.
    ApplyMatching { column: String, value: Value },
}

/// Point of a target transaction where a [`DestinationGate`] can hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePoint {
    Begin,
    Commit,
}

/// Holds the next transaction reaching a [`GatePoint`] until released.
///
/// The gate is one-shot: only the first transaction reaching the point waits, later ones pass.
#[derive(Debug, Clone)]
pub struct DestinationGate {
    reached: Arc<Notify>,
    released: Arc<Notify>,
}

impl DestinationGate {
    fn new() -> Self {
        Self {
            reached: Arc::new(Notify::new()),
            released: Arc::new(Notify::new()),
        }
    }

    /// Waits until a transaction is held at the gate.
    pub async fn reached(&self) {
        TimedNotify::new(self.reached.clone()).notified().await;
    }

    /// Lets the held transaction continue.
    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn hold(&self) {
        self.reached.notify_one();
        self.released.notified().await;
    }
}

#[derive(Debug, Default)]
struct Inner {
    faults: Vec<Fault>,
    gate: Option<(GatePoint, DestinationGate)>,
    commits: u64,
}

impl Inner {
    fn take_gate(&mut self, point: GatePoint) -> Option<DestinationGate> {
        self.gate
            .take_if(|(gate_point, _)| *gate_point == point)
            .map(|(_, gate)| gate)
    }
}

async fn pass_gate(state: &Mutex<Inner>, point: GatePoint) {
    let gate = state.lock().await.take_gate(point);
    if let Some(gate) = gate {
        gate.hold().await;
    }
}

/// Destination wrapper injecting failures into an inner destination.
#[derive(Debug, Clone)]
pub struct FaultyDestination<D> {
    inner: D,
    state: Arc<Mutex<Inner>>,
    committed: Arc<Notify>,
}

impl<D> FaultyDestination<D> {
    pub fn wrap(inner: D) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(Inner::default())),
            committed: Arc::new(Notify::new()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Installs a gate holding the next transaction that reaches `point`.
    pub async fn hold_at(&self, point: GatePoint) -> DestinationGate {
        let gate = DestinationGate::new();
        self.state.lock().await.gate = Some((point, gate.clone()));

        gate
    }

    /// Number of transactions committed through this wrapper.
    pub async fn commits(&self) -> u64 {
        self.state.lock().await.commits
    }

    /// Returns a notification fired after every successful commit.
    pub fn notify_on_commit(&self) -> TimedNotify {
        TimedNotify::new(self.committed.clone())
    }
}

impl<D> Destination for FaultyDestination<D>
where
    D: Destination + Sync,
{
    type Transaction = FaultyTransaction<D::Transaction>;

    fn name() -> &'static str {
        D::name()
    }

    async fn begin(&self) -> CdcResult<Self::Transaction> {
        pass_gate(&self.state, GatePoint::Begin).await;

        if self.state.lock().await.faults.contains(&Fault::Begin) {
            bail!(
                ErrorKind::TargetConnectionFailed,
                "Injected connection failure",
                "begin"
            );
        }

        Ok(FaultyTransaction {
            inner: self.inner.begin().await?,
            state: self.state.clone(),
            committed: self.committed.clone(),
            writes: 0,
        })
    }
}

#[derive(Debug)]
pub struct FaultyTransaction<T> {
    inner: T,
    state: Arc<Mutex<Inner>>,
    committed: Arc<Notify>,
    writes: usize,
}

impl<T> FaultyTransaction<T> {
    async fn check_write(&mut self, image: &RowImage) -> CdcResult<()> {
        let position = self.writes;
        self.writes += 1;

        let state = self.state.lock().await;
        let fails = state.faults.iter().any(|fault| match fault {
            Fault::ApplyAt(at) => *at == position,
            Fault::ApplyMatching { column, value } => image.get(column) == Some(value),
            Fault::Begin | Fault::Commit => false,
        });

        if fails {
            bail!(
                ErrorKind::ApplyFailed,
                "Injected apply failure",
                format!("write {position}")
            );
        }

        Ok(())
    }
}

impl<T> DestinationTransaction for FaultyTransaction<T>
where
    T: DestinationTransaction + Send,
{
    async fn upsert(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        row: &RowImage,
    ) -> CdcResult<()> {
        self.check_write(row).await?;
        self.inner.upsert(target_table, key_columns, row).await
    }

    async fn delete(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        key: &RowImage,
    ) -> CdcResult<()> {
        self.check_write(key).await?;
        self.inner.delete(target_table, key_columns, key).await
    }

    async fn commit(self) -> CdcResult<()> {
        pass_gate(&self.state, GatePoint::Commit).await;

        if self.state.lock().await.faults.contains(&Fault::Commit) {
            self.inner.rollback().await?;
            bail!(
                ErrorKind::TargetConnectionFailed,
                "Injected connection failure",
                "commit"
            );
        }

        self.inner.commit().await?;
        self.state.lock().await.commits += 1;
        self.committed.notify_one();

        Ok(())
    }

    async fn rollback(self) -> CdcResult<()> {
        self.inner.rollback().await
    }
}
