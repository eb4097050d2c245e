use core::time::Duration;

use futures::future::BoxFuture;

/// 操作系统抽象：定时与时钟
///
/// 所有轮询等待（防抖、复位、上电稳定）都通过 `delay` 挂起，
/// 测试中可以替换为虚拟时钟。
pub trait Kernel: Send + Sync + 'static {
    fn delay(&self, duration: Duration) -> BoxFuture<'_, ()>;

    /// 单调时钟
    fn now(&self) -> Duration;
}

pub struct SpinWhile<F>
where
    F: Fn() -> bool,
{
    pub condition: F,
}

impl<F> SpinWhile<F>
where
    F: Fn() -> bool,
{
    #[must_use]
    pub fn new(condition: F) -> Self {
        Self { condition }
    }
}

impl<F> core::future::Future for SpinWhile<F>
where
    F: Fn() -> bool,
{
    type Output = ();

    fn poll(
        self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Self::Output> {
        if (self.condition)() {
            cx.waker().wake_by_ref();
            core::task::Poll::Pending
        } else {
            core::task::Poll::Ready(())
        }
    }
}
