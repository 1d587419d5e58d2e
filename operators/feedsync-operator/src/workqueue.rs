//! 限速工作队列
//!
//! 待处理的键会被去重；失败的键按指数退避延迟后重新入队，
//! 直到调用 [`RateLimitingQueue::forget`] 重置其失败计数。

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use futures::future::poll_fn;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// 默认基础退避时间
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// 默认最大退避时间
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// 限速工作队列
pub struct RateLimitingQueue<K> {
    /// 可以立即处理的键
    ready: VecDeque<K>,
    /// `ready` 中的键，用于去重
    queued: HashSet<K>,
    /// 等待退避结束的键
    delayed: DelayQueue<K>,
    delayed_keys: HashMap<K, Key>,
    /// 每个键的连续失败次数
    failures: HashMap<K, u32>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K: Clone + Eq + Hash> Default for RateLimitingQueue<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K: Clone + Eq + Hash> RateLimitingQueue<K> {
    /// 创建新的工作队列
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            delayed: DelayQueue::new(),
            delayed_keys: HashMap::new(),
            failures: HashMap::new(),
            base_delay,
            max_delay,
        }
    }

    /// 立即入队，已在队列中的键不会重复入队
    pub fn add(&mut self, key: K) {
        if let Some(delay_key) = self.delayed_keys.remove(&key) {
            self.delayed.remove(&delay_key);
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    /// 按退避时间延迟入队，并增加失败计数
    pub fn add_rate_limited(&mut self, key: K) {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let delay = backoff(self.base_delay, self.max_delay, *failures);
        *failures = failures.saturating_add(1);

        if self.queued.contains(&key) || self.delayed_keys.contains_key(&key) {
            return;
        }
        let delay_key = self.delayed.insert(key.clone(), delay);
        self.delayed_keys.insert(key, delay_key);
    }

    /// 重置失败计数
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// 键的连续失败次数
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// 队列中（包括延迟中）的键数量
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed_keys.len()
    }

    /// 队列是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待下一个可处理的键
    ///
    /// 可以安全地在 `select!` 中使用：未完成的等待被取消时不会丢失键。
    pub async fn next(&mut self) -> K {
        loop {
            if let Some(key) = self.ready.pop_front() {
                self.queued.remove(&key);
                return key;
            }

            if self.delayed.is_empty() {
                futures::future::pending::<()>().await;
            }

            if let Some(expired) = poll_fn(|cx| self.delayed.poll_expired(cx)).await {
                let key = expired.into_inner();
                self.delayed_keys.remove(&key);
                if self.queued.insert(key.clone()) {
                    self.ready.push_back(key);
                }
            }
        }
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}
