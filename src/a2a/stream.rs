//! SSE 流解码：字节流 → 逐事件 JSON 值
//!
//! 基于 eventsource-stream 做 SSE 分帧，本层只负责事件负载的 JSON 解析。
//! 空/全空白负载直接跳过；解析失败的负载计数后跳过（单条坏的 keep-alive
//! 不应杀掉整个任务），传输层关闭或出错则序列终止。

use std::pin::Pin;

use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// SSE 解码器：对每次 next_value 调用惰性推进底层流
pub struct StreamDecoder {
    events: Pin<Box<dyn Stream<Item = Result<eventsource_stream::Event, String>> + Send>>,
    malformed: usize,
}

impl StreamDecoder {
    /// 从任意字节块流构建（生产环境为 reqwest 的 bytes_stream，测试可用内存流）
    pub fn new<S, B, E>(bytes: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let events = bytes.eventsource().map(|r| r.map_err(|e| e.to_string()));
        Self {
            events: Box::pin(events),
            malformed: 0,
        }
    }

    /// 下一个可解析的事件负载；流耗尽或传输出错时返回 None。
    /// 调用方观察到协议终止事件后停止调用即可，无需读完剩余字节。
    pub async fn next_value(&mut self) -> Option<Value> {
        while let Some(item) = self.events.next().await {
            match item {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            self.malformed += 1;
                            tracing::warn!(
                                "Skipping malformed SSE payload ({}): {}",
                                e,
                                &data[..data.len().min(200)]
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("SSE transport error, ending stream: {}", e);
                    return None;
                }
            }
        }
        None
    }

    /// 本次流中被跳过的坏负载数
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }
}
