//! 通知总线（主题/观察者）
//!
//! 提供优先级排序、可重入安全的同步发布/订阅机制：
//! - 观察者以弱引用持有，活性可检查，不依赖哨兵值
//! - 派发期间触发的 `notify` 进入信箱队列，当前派发完成后按序重放
//! - 派发期间附加的观察者进入旁路集合，不接收引发其附加的那条消息
//! - 重放次数超过可配置上限时记录诊断并返回错误，而非静默截断

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use thiserror::Error;

/// 默认的消息重放上限
///
/// 在一次外层 `notify` 内连续派发的消息数超过该值，视为反馈回路设计错误。
pub const DEFAULT_REPLAY_LIMIT: usize = 16;

/// 观察者
///
/// 回调以 `&self` 接收，观察者内部状态用 `RefCell` 管理。
pub trait Observer<M> {
    /// 派发优先级，越大越先收到消息
    fn priority(&self) -> i32 {
        0
    }

    /// 收到消息
    fn on_message(&self, message: &M);
}

/// 通知派发错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    /// 队列重放超出上限，剩余消息被丢弃
    #[error("notification replay exceeded limit of {limit} messages, {dropped} message(s) dropped")]
    ReplayOverflow { limit: usize, dropped: usize },
}

/// 观察者注册项
struct Entry<M> {
    observer: Weak<dyn Observer<M>>,
    /// 身份键（附加时的分配地址），用于重复附加检查与分离查找
    key: *const (),
    priority: i32,
    /// 附加序号，同优先级时按附加先后排序
    serial: u64,
    /// 派发中途分离时置为失活，本轮剩余派发跳过
    active: Cell<bool>,
}

impl<M> Entry<M> {
    fn is_live(&self) -> bool {
        self.active.get() && self.observer.strong_count() > 0
    }
}

/// 通知主题
///
/// 单线程协作式：所有附加/分离/派发都发生在同一逻辑控制流上。
pub struct Subject<M> {
    entries: RefCell<Vec<Entry<M>>>,
    /// 派发期间附加的观察者，派发结束后并入主集合
    pending: RefCell<Vec<Entry<M>>>,
    /// 重入 `notify` 的信箱
    mailbox: RefCell<VecDeque<M>>,
    dispatching: Cell<bool>,
    replay_limit: usize,
    serial: Cell<u64>,
}

impl<M> Default for Subject<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Subject<M> {
    /// 创建主题，使用默认重放上限
    pub fn new() -> Self {
        Self::with_replay_limit(DEFAULT_REPLAY_LIMIT)
    }

    /// 创建主题并指定重放上限
    pub fn with_replay_limit(replay_limit: usize) -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            mailbox: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
            replay_limit: replay_limit.max(1),
            serial: Cell::new(0),
        }
    }

    /// 附加观察者
    ///
    /// 重复附加记录错误日志并返回 `false`，不会中断调用方。
    /// 派发期间的附加进入旁路集合，本轮消息不会送达新观察者。
    pub fn attach<O>(&self, observer: &Rc<O>) -> bool
    where
        O: Observer<M> + 'static,
    {
        let key = Rc::as_ptr(observer) as *const ();
        if self.find_key(key) {
            tracing::error!("observer already attached to subject, attach ignored");
            return false;
        }

        let dyn_rc: Rc<dyn Observer<M>> = observer.clone();
        let serial = self.serial.get();
        self.serial.set(serial + 1);
        let entry = Entry {
            observer: Rc::downgrade(&dyn_rc),
            key,
            priority: observer.priority(),
            serial,
            active: Cell::new(true),
        };

        if self.dispatching.get() {
            self.pending.borrow_mut().push(entry);
        } else {
            insert_sorted(&mut self.entries.borrow_mut(), entry);
        }
        true
    }

    /// 分离观察者
    ///
    /// 派发期间的分离只做失活标记，本轮剩余派发跳过该观察者，
    /// 实际移除推迟到派发结束。返回是否找到了该观察者。
    pub fn detach<O>(&self, observer: &Rc<O>) -> bool
    where
        O: Observer<M> + 'static,
    {
        let key = Rc::as_ptr(observer) as *const ();

        // 旁路集合里的可以直接移除（还没参与过任何派发）
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|e| e.key == key && e.is_live()) {
                pending.remove(pos);
                return true;
            }
        }

        if self.dispatching.get() {
            let entries = self.entries.borrow();
            if let Some(entry) = entries.iter().find(|e| e.key == key && e.is_live()) {
                entry.active.set(false);
                return true;
            }
            false
        } else {
            let mut entries = self.entries.borrow_mut();
            if let Some(pos) = entries.iter().position(|e| e.key == key && e.is_live()) {
                entries.remove(pos);
                return true;
            }
            false
        }
    }

    /// 发布消息
    ///
    /// 若当前正在派发（观察者回调内再次 `notify`），消息入队并在本轮
    /// 派发完成后按序重放，返回 `Ok(0)`。否则同步派发，返回送达次数。
    /// 重放超出上限时丢弃剩余消息并返回 [`NotifyError::ReplayOverflow`]。
    pub fn notify(&self, message: M) -> Result<usize, NotifyError> {
        self.mailbox.borrow_mut().push_back(message);
        if self.dispatching.get() {
            // 排队，由外层泵送
            return Ok(0);
        }

        let mut delivered = 0;
        let mut processed = 0;
        loop {
            let next = self.mailbox.borrow_mut().pop_front();
            let Some(message) = next else { break };

            if processed >= self.replay_limit {
                let dropped = self.mailbox.borrow_mut().len() + 1;
                self.mailbox.borrow_mut().clear();
                tracing::error!(
                    limit = self.replay_limit,
                    dropped,
                    "notification replay exceeded limit, probable feedback loop"
                );
                return Err(NotifyError::ReplayOverflow {
                    limit: self.replay_limit,
                    dropped,
                });
            }
            processed += 1;
            delivered += self.dispatch_one(&message);
        }
        Ok(delivered)
    }

    /// 当前活跃观察者数量
    pub fn observer_count(&self) -> usize {
        self.entries.borrow().iter().filter(|e| e.is_live()).count()
            + self.pending.borrow().iter().filter(|e| e.is_live()).count()
    }

    fn find_key(&self, key: *const ()) -> bool {
        self.entries
            .borrow()
            .iter()
            .chain(self.pending.borrow().iter())
            .any(|e| e.key == key && e.is_live())
    }

    /// 派发单条消息并在结束后清理失活项、并入旁路集合
    fn dispatch_one(&self, message: &M) -> usize {
        let mut count = 0;
        self.dispatching.set(true);
        {
            let entries = self.entries.borrow();
            for entry in entries.iter() {
                if !entry.active.get() {
                    continue;
                }
                match entry.observer.upgrade() {
                    Some(observer) => {
                        observer.on_message(message);
                        count += 1;
                    }
                    None => entry.active.set(false),
                }
            }
        }
        self.dispatching.set(false);

        let mut entries = self.entries.borrow_mut();
        entries.retain(|e| e.is_live());
        for entry in self.pending.borrow_mut().drain(..) {
            insert_sorted(&mut entries, entry);
        }
        count
    }
}

/// 按（优先级降序，附加序号升序）插入
fn insert_sorted<M>(entries: &mut Vec<Entry<M>>, entry: Entry<M>) {
    let pos = entries
        .binary_search_by(|e| {
            (std::cmp::Reverse(e.priority), e.serial)
                .cmp(&(std::cmp::Reverse(entry.priority), entry.serial))
        })
        .unwrap_or_else(|pos| pos);
    entries.insert(pos, entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 记录收到的消息，便于断言派发顺序
    struct Recorder {
        tag: &'static str,
        priority: i32,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Recorder {
        fn new(tag: &'static str, priority: i32, log: &Rc<RefCell<Vec<String>>>) -> Rc<Self> {
            Rc::new(Self {
                tag,
                priority,
                log: log.clone(),
            })
        }
    }

    impl Observer<i32> for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn on_message(&self, message: &i32) {
            self.log.borrow_mut().push(format!("{}:{}", self.tag, message));
        }
    }

    #[test]
    fn test_priority_order() {
        let subject = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let low = Recorder::new("low", 0, &log);
        let high = Recorder::new("high", 10, &log);
        let mid = Recorder::new("mid", 5, &log);

        assert!(subject.attach(&low));
        assert!(subject.attach(&high));
        assert!(subject.attach(&mid));

        subject.notify(1).unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            &["high:1", "mid:1", "low:1"]
        );
    }

    #[test]
    fn test_double_attach_rejected() {
        let subject = Subject::<i32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let obs = Recorder::new("a", 0, &log);

        assert!(subject.attach(&obs));
        assert!(!subject.attach(&obs));
        assert_eq!(subject.observer_count(), 1);
    }

    #[test]
    fn test_detach() {
        let subject = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let obs = Recorder::new("a", 0, &log);

        subject.attach(&obs);
        assert!(subject.detach(&obs));
        assert!(!subject.detach(&obs));

        subject.notify(1).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_dead_observer_skipped() {
        let subject = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let obs = Recorder::new("a", 0, &log);

        subject.attach(&obs);
        drop(obs);

        let delivered = subject.notify(1).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(subject.observer_count(), 0);
    }

    /// 回调内再次 notify 的观察者
    struct Reentrant {
        subject: Rc<Subject<i32>>,
        log: Rc<RefCell<Vec<String>>>,
        fired: Cell<bool>,
    }

    impl Observer<i32> for Reentrant {
        fn priority(&self) -> i32 {
            100
        }

        fn on_message(&self, message: &i32) {
            self.log.borrow_mut().push(format!("re:{}", message));
            if !self.fired.get() {
                self.fired.set(true);
                // 重入发布：必须排队到本轮派发之后
                let queued = self.subject.notify(message + 1).unwrap();
                assert_eq!(queued, 0);
            }
        }
    }

    #[test]
    fn test_reentrant_notify_is_queued() {
        let subject = Rc::new(Subject::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let reentrant = Rc::new(Reentrant {
            subject: subject.clone(),
            log: log.clone(),
            fired: Cell::new(false),
        });
        let tail = Recorder::new("tail", 0, &log);

        subject.attach(&reentrant);
        subject.attach(&tail);

        subject.notify(1).unwrap();

        // 第一条消息的派发（re:1, tail:1）完整结束后才轮到第二条
        assert_eq!(
            log.borrow().as_slice(),
            &["re:1", "tail:1", "re:2", "tail:2"]
        );
    }

    /// 回调内附加新观察者
    struct AttachDuring {
        subject: Rc<Subject<i32>>,
        late: Rc<Recorder>,
        done: Cell<bool>,
    }

    impl Observer<i32> for AttachDuring {
        fn on_message(&self, _message: &i32) {
            if !self.done.get() {
                self.done.set(true);
                assert!(self.subject.attach(&self.late));
            }
        }
    }

    #[test]
    fn test_attach_during_dispatch_misses_current_message() {
        let subject = Rc::new(Subject::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let late = Recorder::new("late", 0, &log);
        let attacher = Rc::new(AttachDuring {
            subject: subject.clone(),
            late: late.clone(),
            done: Cell::new(false),
        });

        subject.attach(&attacher);

        subject.notify(1).unwrap();
        assert!(log.borrow().is_empty());

        subject.notify(2).unwrap();
        assert_eq!(log.borrow().as_slice(), &["late:2"]);
    }

    /// 回调内分离另一个观察者
    struct DetachDuring {
        subject: Rc<Subject<i32>>,
        victim: Rc<Recorder>,
    }

    impl Observer<i32> for DetachDuring {
        fn priority(&self) -> i32 {
            // 先于 victim 收到消息
            10
        }

        fn on_message(&self, _message: &i32) {
            self.subject.detach(&self.victim);
        }
    }

    #[test]
    fn test_detach_during_dispatch_skips_remainder() {
        let subject = Rc::new(Subject::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let victim = Recorder::new("victim", 0, &log);
        let detacher = Rc::new(DetachDuring {
            subject: subject.clone(),
            victim: victim.clone(),
        });

        subject.attach(&detacher);
        subject.attach(&victim);

        subject.notify(1).unwrap();
        // victim 在本轮派发内已被失活
        assert!(log.borrow().is_empty());
        assert_eq!(subject.observer_count(), 1);
    }

    /// 每次收到消息都继续发布，制造反馈回路
    struct Feedback {
        subject: Rc<Subject<i32>>,
    }

    impl Observer<i32> for Feedback {
        fn on_message(&self, message: &i32) {
            let _ = self.subject.notify(message + 1);
        }
    }

    #[test]
    fn test_replay_overflow_reported() {
        let subject = Rc::new(Subject::with_replay_limit(4));
        let feedback = Rc::new(Feedback {
            subject: subject.clone(),
        });
        subject.attach(&feedback);

        let result = subject.notify(0);
        assert_eq!(
            result,
            Err(NotifyError::ReplayOverflow {
                limit: 4,
                dropped: 1
            })
        );

        // 溢出后信箱已清空，总线可以继续使用
        subject.detach(&feedback);
        assert_eq!(subject.notify(1), Ok(0));
    }
}
