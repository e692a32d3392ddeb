//! 行情网关桥接客户端。
//!
//! 进程不直接说 OpenD 的私有协议，而是连本机桥接服务，NDJSON 逐行
//! 成帧：订阅/轮询走请求应答（按 id 关联），推送批次由读取任务转进
//! push 通道。这里是唯一知道线上行格式的模块，往上全是 RawTickerRow。

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tkcommon::error::{AppError, Result};
use crate::tkcommon::models::RawTickerRow;

/// 单个请求的应答等待上限
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 上游采集面。驱动层与测试都只面向这个接口。
pub trait QuoteGateway: Send {
    /// 建立连接并启动推送分发。
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// 订阅整个符号清单的逐笔推送。
    fn subscribe(&mut self, symbols: &[String]) -> impl Future<Output = Result<()>> + Send;

    /// 拉取某品种最近 num 行，轮询与补抓共用。
    fn get_rt_ticker(
        &mut self,
        symbol: &str,
        num: usize,
    ) -> impl Future<Output = Result<Vec<RawTickerRow>>> + Send;

    /// 连接活性探测，失败视作断线。
    fn probe(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    op: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    rows: Option<Vec<RawTickerRow>>,
}

type PendingMap = Arc<TokioMutex<HashMap<u64, oneshot::Sender<InboundFrame>>>>;

struct Connection {
    writer: OwnedWriteHalf,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

/// 桥接网关客户端。推送行从 push_tx 出去，由驱动层消费。
pub struct BridgeGateway {
    host: String,
    port: u16,
    push_tx: mpsc::UnboundedSender<Vec<RawTickerRow>>,
    conn: Option<Connection>,
    next_id: u64,
}

impl BridgeGateway {
    pub fn new(host: &str, port: u16, push_tx: mpsc::UnboundedSender<Vec<RawTickerRow>>) -> Self {
        Self {
            host: host.to_string(),
            port,
            push_tx,
            conn: None,
            next_id: 0,
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        match self.conn.as_mut() {
            Some(conn) if conn.alive.load(Ordering::SeqCst) => Ok(conn),
            Some(_) => Err(AppError::GatewayError("connection lost".to_string())),
            None => Err(AppError::GatewayError("not connected".to_string())),
        }
    }

    async fn request(&mut self, frame: serde_json::Value, id: u64) -> Result<InboundFrame> {
        let (tx, rx) = oneshot::channel();
        let conn = self.connection()?;
        conn.pending.lock().await.insert(id, tx);

        let mut line = frame.to_string();
        line.push('\n');
        if let Err(err) = conn.writer.write_all(line.as_bytes()).await {
            conn.pending.lock().await.remove(&id);
            return Err(AppError::GatewayError(format!("write failed: {err}")));
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx).await;
        match response {
            Ok(Ok(frame)) => {
                if frame.ok.unwrap_or(true) {
                    Ok(frame)
                } else {
                    Err(AppError::GatewayError(
                        frame.msg.unwrap_or_else(|| "request refused".to_string()),
                    ))
                }
            }
            Ok(Err(_)) => Err(AppError::GatewayError(
                "connection closed while waiting for response".to_string(),
            )),
            Err(_) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.pending.lock().await.remove(&id);
                }
                Err(AppError::GatewayError("request timed out".to_string()))
            }
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn spawn_reader(
        read_half: OwnedReadHalf,
        pending: PendingMap,
        alive: Arc<AtomicBool>,
        push_tx: mpsc::UnboundedSender<Vec<RawTickerRow>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let frame: InboundFrame = match serde_json::from_str(line) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, "gateway_bad_frame");
                                continue;
                            }
                        };
                        let op = frame.op.clone();
                        match op.as_str() {
                            "push" => {
                                let rows = frame.rows.unwrap_or_default();
                                if !rows.is_empty() && push_tx.send(rows).is_err() {
                                    // 驱动侧已经关了，读取任务没有存在意义
                                    break;
                                }
                            }
                            "ack" | "rt_ticker" | "pong" => {
                                if let Some(id) = frame.id {
                                    if let Some(tx) = pending.lock().await.remove(&id) {
                                        let _ = tx.send(frame);
                                    } else {
                                        debug!(id, "gateway_unmatched_response");
                                    }
                                }
                            }
                            other => {
                                debug!(op = other, "gateway_unknown_frame");
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("gateway_connection_eof");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "gateway_read_failed");
                        break;
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            pending.lock().await.clear();
        })
    }
}

impl QuoteGateway for BridgeGateway {
    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let addr = format!("{}:{}", self.host, self.port);
        info!(addr = %addr, "gateway_connecting");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| AppError::GatewayError(format!("connect {addr} failed: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| AppError::GatewayError(format!("set_nodelay failed: {err}")))?;

        let (read_half, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(TokioMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader_task = Self::spawn_reader(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&alive),
            self.push_tx.clone(),
        );

        self.conn = Some(Connection {
            writer,
            pending,
            alive,
            reader_task,
        });
        info!(addr = %addr, "gateway_connected");
        Ok(())
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<()> {
        let id = self.alloc_id();
        let frame = json!({
            "op": "subscribe",
            "id": id,
            "sub_type": "TICKER",
            "symbols": symbols,
        });
        self.request(frame, id).await?;
        info!(symbols = %symbols.join(","), "gateway_subscribed");
        Ok(())
    }

    async fn get_rt_ticker(&mut self, symbol: &str, num: usize) -> Result<Vec<RawTickerRow>> {
        let id = self.alloc_id();
        let frame = json!({
            "op": "get_rt_ticker",
            "id": id,
            "symbol": symbol,
            "num": num,
        });
        let response = self.request(frame, id).await?;
        Ok(response.rows.unwrap_or_default())
    }

    async fn probe(&mut self) -> Result<()> {
        let id = self.alloc_id();
        let frame = json!({ "op": "ping", "id": id });
        self.request(frame, id).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.writer.shutdown().await;
            conn.reader_task.abort();
            conn.alive.store(false, Ordering::SeqCst);
        }
    }
}
