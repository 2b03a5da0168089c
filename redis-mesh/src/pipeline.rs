//! Batching of commands into shared round trips
//!
//! A [`BatchingPipeline`] sits in front of one endpoint. Callers submit
//! commands as usual and await their own reply; a background task collects
//! queued commands and flushes them together once the batch reaches the
//! configured size or the oldest command has waited for the flush interval,
//! whichever comes first.
//!
//! Each caller gets its own reply, so a server error on one command does
//! not affect its neighbours. A transport failure fails the whole batch.

use crate::endpoint::{CommandRunner, EndpointClient};
use crate::protocol::CommandFrame;
use async_trait::async_trait;
use redis_mesh_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Something that can run a batch of commands in one round trip
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Execute a batch of commands and return their replies in order
    ///
    /// Per-command failures are returned inline as [`RespValue::Error`].
    async fn execute_batch(&self, commands: Vec<CommandFrame>) -> RedisResult<Vec<RespValue>>;
}

#[async_trait]
impl BatchExecutor for EndpointClient {
    async fn execute_batch(&self, commands: Vec<CommandFrame>) -> RedisResult<Vec<RespValue>> {
        self.execute_pipeline(&commands).await
    }
}

/// A command waiting for the next flush
struct PendingCommand {
    command: String,
    args: Vec<RespValue>,
    queued_at: Instant,
    response_tx: oneshot::Sender<RedisResult<RespValue>>,
}

/// Coalesces commands against one endpoint into batched writes
pub struct BatchingPipeline {
    command_tx: mpsc::UnboundedSender<PendingCommand>,
}

impl BatchingPipeline {
    /// Start a pipeline in front of `executor`
    ///
    /// Must be called inside a tokio runtime. The background task stops once
    /// the pipeline is dropped and the queue has drained.
    pub fn new(executor: Arc<dyn BatchExecutor>, flush_interval: Duration, flush_count: usize) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_batches(
            executor,
            command_rx,
            flush_interval,
            flush_count.max(1),
        ));
        Self { command_tx }
    }

    /// Queue a command and wait for its reply
    pub async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(PendingCommand {
                command: command.to_string(),
                args,
                queued_at: Instant::now(),
                response_tx,
            })
            .map_err(|_| RedisError::Shutdown("pipeline stopped".to_string()))?;

        response_rx
            .await
            .map_err(|_| RedisError::Connection("Pipeline dropped the response".to_string()))?
    }
}

#[async_trait]
impl CommandRunner for BatchingPipeline {
    async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        BatchingPipeline::execute(self, command, args).await
    }
}

async fn run_batches(
    executor: Arc<dyn BatchExecutor>,
    mut command_rx: mpsc::UnboundedReceiver<PendingCommand>,
    flush_interval: Duration,
    flush_count: usize,
) {
    let mut closed = false;
    while !closed {
        let Some(first) = command_rx.recv().await else {
            break;
        };
        let deadline = first.queued_at + flush_interval;
        let mut batch = Vec::with_capacity(flush_count);
        batch.push(first);

        while batch.len() < flush_count {
            tokio::select! {
                biased;
                next = command_rx.recv() => match next {
                    Some(cmd) => batch.push(cmd),
                    None => {
                        closed = true;
                        break;
                    }
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        flush(executor.as_ref(), batch).await;
    }
    debug!("Batching pipeline stopped");
}

async fn flush(executor: &dyn BatchExecutor, batch: Vec<PendingCommand>) {
    let mut frames = Vec::with_capacity(batch.len());
    let mut waiters = Vec::with_capacity(batch.len());
    for pending in batch {
        frames.push((pending.command, pending.args));
        waiters.push(pending.response_tx);
    }
    debug!("Flushing {} pipelined commands", frames.len());

    match executor.execute_batch(frames).await {
        Ok(replies) if replies.len() == waiters.len() => {
            for (waiter, reply) in waiters.into_iter().zip(replies) {
                // Ignore send errors - the caller may have given up
                let _ = waiter.send(reply.into_result());
            }
        }
        Ok(replies) => {
            let err = RedisError::UnexpectedResponse(format!(
                "Pipeline returned {} replies for {} commands",
                replies.len(),
                waiters.len()
            ));
            fail_all(waiters, &err);
        }
        Err(e) => {
            warn!("Pipeline flush failed: {}", e);
            fail_all(waiters, &e);
        }
    }
}

fn fail_all(waiters: Vec<oneshot::Sender<RedisResult<RespValue>>>, err: &RedisError) {
    for waiter in waiters {
        let _ = waiter.send(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockExecutor {
        batches: Mutex<Vec<usize>>,
        fail: bool,
        latency: Duration,
    }

    #[async_trait]
    impl BatchExecutor for MockExecutor {
        async fn execute_batch(&self, commands: Vec<CommandFrame>) -> RedisResult<Vec<RespValue>> {
            self.batches.lock().unwrap().push(commands.len());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fail {
                return Err(RedisError::Connection("reset by peer".to_string()));
            }
            Ok(commands
                .into_iter()
                .map(|(cmd, args)| match cmd.as_str() {
                    "ECHO" => args.into_iter().next().unwrap_or(RespValue::Null),
                    _ => RespValue::Error(format!("ERR unknown command '{cmd}'")),
                })
                .collect())
        }
    }

    fn echo(pipeline: &Arc<BatchingPipeline>, n: usize) -> tokio::task::JoinHandle<RedisResult<RespValue>> {
        let pipeline = Arc::clone(pipeline);
        tokio::spawn(async move {
            pipeline
                .execute("ECHO", vec![RespValue::from(n.to_string())])
                .await
        })
    }

    #[tokio::test]
    async fn test_flush_on_command_count() {
        let executor = Arc::new(MockExecutor::default());
        let pipeline = Arc::new(BatchingPipeline::new(
            executor.clone(),
            Duration::from_secs(3600),
            4,
        ));

        let handles: Vec<_> = (0..8).map(|n| echo(&pipeline, n)).collect();
        for (n, handle) in handles.into_iter().enumerate() {
            let reply = handle.await.unwrap().unwrap();
            assert_eq!(reply, RespValue::from(n.to_string()));
        }

        let batches = executor.batches.lock().unwrap().clone();
        assert_eq!(batches.iter().sum::<usize>(), 8);
        assert!(batches.iter().all(|&size| size <= 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let executor = Arc::new(MockExecutor::default());
        let pipeline = BatchingPipeline::new(executor.clone(), Duration::from_millis(20), 100);

        let started = Instant::now();
        let reply = pipeline
            .execute("ECHO", vec![RespValue::from("solo")])
            .await
            .unwrap();
        assert_eq!(reply, RespValue::from("solo"));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(*executor.batches.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_fills_batch_after_deadline() {
        let executor = Arc::new(MockExecutor {
            latency: Duration::from_millis(50),
            ..Default::default()
        });
        let pipeline = Arc::new(BatchingPipeline::new(
            executor.clone(),
            Duration::from_millis(1),
            8,
        ));

        let first = echo(&pipeline, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Queued while the first flush is in flight, so their deadline has
        // already passed when the next batch is assembled
        let backlog: Vec<_> = (1..=8).map(|n| echo(&pipeline, n)).collect();
        first.await.unwrap().unwrap();
        for handle in backlog {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*executor.batches.lock().unwrap(), vec![1, 8]);
    }

    #[tokio::test]
    async fn test_per_command_errors_stay_isolated() {
        let executor = Arc::new(MockExecutor::default());
        let pipeline = Arc::new(BatchingPipeline::new(
            executor.clone(),
            Duration::from_millis(50),
            2,
        ));

        let good = echo(&pipeline, 1);
        let bad = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.execute("NOSUCHCMD", vec![]).await })
        };

        assert_eq!(good.await.unwrap().unwrap(), RespValue::from("1"));
        let err = bad.await.unwrap().unwrap_err();
        assert!(err.is_script_error());
    }

    #[tokio::test]
    async fn test_transport_failure_fails_whole_batch() {
        let executor = Arc::new(MockExecutor {
            fail: true,
            ..Default::default()
        });
        let pipeline = Arc::new(BatchingPipeline::new(
            executor.clone(),
            Duration::from_millis(20),
            3,
        ));

        let handles: Vec<_> = (0..3).map(|n| echo(&pipeline, n)).collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_transport());
        }
    }

    #[tokio::test]
    async fn test_pipeline_against_endpoint() {
        let server = crate::test_server::TestServer::start().await;
        let client = Arc::new(EndpointClient::new(
            "redis://test",
            server.addr(),
            redis_mesh_core::ConnectionConfig::default(),
        ));
        let pipeline = Arc::new(BatchingPipeline::new(client, Duration::from_millis(5), 16));

        let mut handles = Vec::new();
        for i in 0..10 {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                let key = format!("k{i}");
                pipeline
                    .execute("SET", vec![key.as_str().into(), "v".into()])
                    .await?;
                pipeline.execute("GET", vec![key.as_str().into()]).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), RespValue::from("v"));
        }
    }
}
