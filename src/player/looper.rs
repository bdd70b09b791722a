use crate::core::{PlayerError, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::process;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 发往消息线程的命令
enum LooperCommand<M> {
    Post(M),
    PostAt(M, Instant),
    /// 先移除所有相等的待处理消息，再投递（None = 立即）
    Replace(M, Option<Instant>),
    Remove(M),
    Quit { drain: bool },
}

/// 消息线程的投递端（可克隆，可跨线程）
pub struct LooperHandle<M> {
    tx: Sender<LooperCommand<M>>,
}

impl<M> Clone for LooperHandle<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M: Send + PartialEq + 'static> LooperHandle<M> {
    /// 立即投递；线程已退出时返回 false
    pub fn post(&self, msg: M) -> bool {
        self.tx.send(LooperCommand::Post(msg)).is_ok()
    }

    pub fn post_delayed(&self, msg: M, delay: Duration) -> bool {
        self.tx.send(LooperCommand::PostAt(msg, Instant::now() + delay)).is_ok()
    }

    /// 投递并去重：保证同类消息最多只有一个待处理
    pub fn post_replacing(&self, msg: M) -> bool {
        self.tx.send(LooperCommand::Replace(msg, None)).is_ok()
    }

    pub fn post_delayed_replacing(&self, msg: M, delay: Duration) -> bool {
        self.tx
            .send(LooperCommand::Replace(msg, Some(Instant::now() + delay)))
            .is_ok()
    }

    /// 移除所有与 `msg` 相等的待处理消息
    pub fn remove_messages(&self, msg: M) {
        let _ = self.tx.send(LooperCommand::Remove(msg));
    }
}

/// 单线程消息循环
///
/// 每个管线阶段拥有一个 Looper：所有状态变更都在这个线程上串行执行，
/// 支持延迟消息、去重投递和两种退出方式（立即 / 处理完已到期消息后）。
pub struct Looper<M> {
    name: String,
    handle: LooperHandle<M>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// 尚未启动线程的消息接收端
pub struct LooperMailbox<M> {
    rx: Receiver<LooperCommand<M>>,
}

impl<M: Send + PartialEq + 'static> Looper<M> {
    /// 创建投递端和接收端；接收端交给 `spawn` 启动线程
    ///
    /// 拆成两步是为了让处理函数可以持有拥有者的弱引用。
    pub fn new(name: impl Into<String>) -> (Self, LooperMailbox<M>) {
        let (tx, rx) = unbounded();
        let looper = Self {
            name: name.into(),
            handle: LooperHandle { tx },
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        };
        (looper, LooperMailbox { rx })
    }

    /// 启动消息线程
    pub fn spawn<F>(&self, mailbox: LooperMailbox<M>, handler: F) -> Result<()>
    where
        F: FnMut(M) + Send + 'static,
    {
        let name = self.name.clone();
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                debug!("{} 🧵 消息线程启动: {}", log_ctx(), name);
                let mut queue = MessageQueue::new();
                queue.run(mailbox.rx, handler);
                debug!("{} 🛑 消息线程退出: {}", log_ctx(), name);
            })
            .map_err(|e| PlayerError::Other(format!("启动线程 {} 失败: {}", self.name, e)))?;

        *self.thread_id.lock() = Some(join.thread().id());
        *self.thread.lock() = Some(join);
        Ok(())
    }

    /// 创建并立即启动
    pub fn start<F>(name: impl Into<String>, handler: F) -> Result<Self>
    where
        F: FnMut(M) + Send + 'static,
    {
        let (looper, mailbox) = Self::new(name);
        looper.spawn(mailbox, handler)?;
        Ok(looper)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> LooperHandle<M> {
        self.handle.clone()
    }

    /// 当前线程是否就是消息线程
    pub fn is_current_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    /// 立即退出：丢弃所有待处理消息，等待正在执行的消息处理完
    pub fn quit(&self) {
        self.shutdown(false);
    }

    /// 处理完已到期的消息后退出
    pub fn quit_safely(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, drain: bool) {
        let _ = self.handle.tx.send(LooperCommand::Quit { drain });
        if self.is_current_thread() {
            // 在自己的线程上退出：不能 join 自己
            return;
        }
        let join = self.thread.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                warn!("{} ⚠️ 消息线程 {} 异常退出", log_ctx(), self.name);
            } else {
                info!("{} ⏹ 消息线程 {} 已停止", log_ctx(), self.name);
            }
        }
    }
}

impl<M> Deref for Looper<M> {
    type Target = LooperHandle<M>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<M> Drop for Looper<M> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(LooperCommand::Quit { drain: false });
        let join = self.thread.get_mut().take();
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

/// 消息线程内部的待处理队列
struct MessageQueue<M> {
    ready: VecDeque<M>,
    /// 按 (到期时间, 投递顺序) 排序的延迟消息
    delayed: Vec<(Instant, u64, M)>,
    seq: u64,
}

impl<M: PartialEq> MessageQueue<M> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            seq: 0,
        }
    }

    fn run<F: FnMut(M)>(&mut self, rx: Receiver<LooperCommand<M>>, mut handler: F) {
        loop {
            // ========== 步骤1: 吸收所有已到达的命令（非阻塞） ==========
            loop {
                match rx.try_recv() {
                    Ok(cmd) => {
                        if let Some(drain) = self.apply(cmd) {
                            self.finish(drain, &mut handler);
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            // ========== 步骤2: 到期的延迟消息转入就绪队列 ==========
            self.promote_due(Instant::now());

            // ========== 步骤3: 每轮只处理一条消息，保证命令及时生效 ==========
            if let Some(msg) = self.ready.pop_front() {
                handler(msg);
                continue;
            }

            // ========== 步骤4: 阻塞等待下一条命令或最近的延迟消息 ==========
            let cmd = match self.delayed.first().map(|(at, _, _)| *at) {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => return,
                },
            };
            if let Some(drain) = self.apply(cmd) {
                self.finish(drain, &mut handler);
                return;
            }
        }
    }

    /// 应用一条命令；返回 Some(drain) 表示需要退出
    fn apply(&mut self, cmd: LooperCommand<M>) -> Option<bool> {
        match cmd {
            LooperCommand::Post(msg) => self.ready.push_back(msg),
            LooperCommand::PostAt(msg, at) => self.insert_delayed(msg, at),
            LooperCommand::Replace(msg, at) => {
                self.remove(&msg);
                match at {
                    Some(at) => self.insert_delayed(msg, at),
                    None => self.ready.push_back(msg),
                }
            }
            LooperCommand::Remove(msg) => self.remove(&msg),
            LooperCommand::Quit { drain } => return Some(drain),
        }
        None
    }

    fn insert_delayed(&mut self, msg: M, at: Instant) {
        self.seq += 1;
        let seq = self.seq;
        let pos = self
            .delayed
            .partition_point(|(when, s, _)| (*when, *s) <= (at, seq));
        self.delayed.insert(pos, (at, seq, msg));
    }

    fn remove(&mut self, msg: &M) {
        self.ready.retain(|m| m != msg);
        self.delayed.retain(|(_, _, m)| m != msg);
    }

    fn promote_due(&mut self, now: Instant) {
        let due = self.delayed.partition_point(|(when, _, _)| *when <= now);
        for (_, _, msg) in self.delayed.drain(..due) {
            self.ready.push_back(msg);
        }
    }

    fn finish<F: FnMut(M)>(&mut self, drain: bool, handler: &mut F) {
        if !drain {
            return;
        }
        self.promote_due(Instant::now());
        while let Some(msg) = self.ready.pop_front() {
            handler(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestMsg {
        Tick(u32),
        Block,
    }

    #[test]
    fn test_messages_run_in_order() {
        let (tx, rx) = unbounded();
        let looper = Looper::start("test-order", move |msg: TestMsg| {
            let _ = tx.send(msg);
        })
        .unwrap();

        for i in 0..5 {
            looper.post(TestMsg::Tick(i));
        }
        for i in 0..5 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), TestMsg::Tick(i));
        }
        looper.quit();
    }

    #[test]
    fn test_delayed_message_waits() {
        let (tx, rx) = unbounded();
        let looper = Looper::start("test-delay", move |msg: TestMsg| {
            let _ = tx.send((msg, Instant::now()));
        })
        .unwrap();

        let posted = Instant::now();
        looper.post_delayed(TestMsg::Tick(1), Duration::from_millis(50));
        looper.post(TestMsg::Tick(2));

        let (first, _) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, TestMsg::Tick(2));
        let (second, at) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second, TestMsg::Tick(1));
        assert!(at.duration_since(posted) >= Duration::from_millis(50));
    }

    #[test]
    fn test_replace_keeps_single_pending() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let looper = Looper::start("test-replace", move |msg: TestMsg| match msg {
            TestMsg::Block => {
                let _ = gate_rx.recv();
            }
            TestMsg::Tick(_) => {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        // 先阻塞消息线程，再投递多条相同消息
        looper.post(TestMsg::Block);
        for _ in 0..10 {
            looper.post_replacing(TestMsg::Tick(7));
        }
        gate_tx.send(()).unwrap();
        looper.quit_safely();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_drops_pending() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let looper = Looper::start("test-remove", move |_msg: TestMsg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        looper.post_delayed(TestMsg::Tick(1), Duration::from_millis(30));
        looper.remove_messages(TestMsg::Tick(1));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        looper.quit();
    }

    #[test]
    fn test_quit_from_own_thread_does_not_deadlock() {
        let (done_tx, done_rx) = unbounded();
        let (looper, mailbox) = Looper::<TestMsg>::new("test-self-quit");
        let looper = Arc::new(looper);
        let weak = Arc::downgrade(&looper);
        looper
            .spawn(mailbox, move |_msg| {
                // 在处理函数里退出自己
                if let Some(l) = weak.upgrade() {
                    l.quit();
                }
                let _ = done_tx.send(());
            })
            .unwrap();

        looper.post(TestMsg::Tick(0));
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
