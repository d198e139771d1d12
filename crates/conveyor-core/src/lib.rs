//! conveyor-core
//!
//! Task scheduling and durable drain substrate.
//!
//! Producers append tasks to a stream-oriented queue, consumers claim them
//! under a lease and ack a terminal result, and the drainer copies ack records
//! into the durable store (the system of record) behind a per-stream checkpoint.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, entry, lease, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（QueueBackend, DurableStore, Clock, IdGenerator）
//! - **queue**: リトライ方針とシャーディング
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **impls**: 実装（InMemoryQueueBackend, ShardedQueueBackend, InMemoryDurableStore, ...）
//! - **app**: Producer / Consumer / Drainer / DeadLetters
//! - **config**: JSON 設定と起動時検証
//! - **observability**: tracing 初期化とキューの集計ビュー

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;
