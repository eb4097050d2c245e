//! 端口初始化：复位、探测端点 0、分配地址、读取描述符
//!
//! 复位后的设备都响应地址 0，整个过程在总线的地址 0 锁内完成。

use usb_if::{
    descriptor::{DescriptorType, DeviceDescriptor},
    host::ControlSetup,
    transfer::{Recipient, Request, RequestType},
};

use super::{
    Hub,
    reset::{HUB_BH_RESET_TIME, HUB_LONG_RESET_TIME, HUB_ROOT_RESET_TIME, HUB_SHORT_RESET_TIME},
};
use crate::{
    DeviceId, DeviceSpeed,
    bus::Bus,
    device::{DeviceState, TtLink},
    err::{Result, USBError, is_gone},
    hcd::HcCapabilities,
};

/// 分配地址的尝试次数
pub const SET_ADDRESS_TRIES: usize = 2;

/// 读取描述符前缀的尝试次数
pub const GET_DESCRIPTOR_TRIES: usize = 2;

/// 新枚举方式先读 64 字节描述符，得到 bMaxPacketSize0
const GET_DESCRIPTOR_BUFSIZE: usize = 64;

/// 单次描述符读取的结果
enum Attempt {
    Done,
    Retry(USBError),
}

struct InitContext {
    udev: DeviceId,
    port: u8,
    devnum: u8,
    speed: DeviceSpeed,
    delay: u64,
    use_new_scheme: bool,
    wusb: bool,
}

impl Bus {
    /// 初始化端口上的新设备（或复位已有设备）
    ///
    /// `retry` 是外层枚举循环的第几次尝试，决定使用新旧哪种枚举方式。
    /// 失败时端口被禁用，设备的地址恢复为分配时的值以便断开时释放。
    pub(crate) async fn hub_port_init(
        &self,
        hub: &Hub,
        udev: DeviceId,
        port: u8,
        retry: usize,
    ) -> Result {
        let (oldspeed, devnum) = self.read_device(udev, |d| (d.speed, d.devnum))?;
        let mut delay = if hub.is_root {
            HUB_ROOT_RESET_TIME
        } else {
            HUB_SHORT_RESET_TIME
        };
        // 一些低速设备需要更长的复位时间
        if oldspeed == Some(DeviceSpeed::Low) {
            delay = HUB_LONG_RESET_TIME;
        }

        let _address0 = self.address0.lock().await;
        let result = self
            .hub_port_init_locked(hub, udev, port, retry, oldspeed, devnum, delay)
            .await;
        if result.is_err() {
            let _ = self.hub_port_disable(hub, port, false).await;
            // 设备可能已经被释放
            let _ = self.update_devnum(udev, devnum);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn hub_port_init_locked(
        &self,
        hub: &Hub,
        udev: DeviceId,
        port: u8,
        retry: usize,
        oldspeed: Option<DeviceSpeed>,
        devnum: u8,
        delay: u64,
    ) -> Result {
        self.hub_port_reset(hub, port, Some(udev), delay, false)
            .await?;

        let (speed, wusb, reset) =
            self.read_device(udev, |d| (d.speed, d.wusb, !d.configs.is_empty()))?;
        let speed = speed.ok_or(USBError::DeviceGone)?;
        if oldspeed.is_some_and(|old| old != speed) {
            debug!("device {udev}: device reset changed speed!");
            return Err(USBError::DeviceGone);
        }

        let ep0 = speed.default_max_packet_size0();
        self.update_device(udev, |d| d.ep0_max_packet = ep0)?;

        let verb = if reset { "reset" } else { "new" };
        if !speed.is_superspeed() {
            info!("{verb} {speed:?} USB device number {devnum}, hub {} port {port}", hub.hdev);
        }

        self.setup_tt(hub, udev, port, speed)?;

        let caps = self.caps();
        let ctx = InitContext {
            udev,
            port,
            devnum,
            speed,
            delay,
            use_new_scheme: self.config.use_new_scheme(retry)
                && !caps.contains(HcCapabilities::USB3)
                && !(caps.contains(HcCapabilities::ROOT_OLD_ENUM) && hub.is_root),
            wusb,
        };

        let mut result = Ok(());
        for _ in 0..GET_DESCRIPTOR_TRIES {
            match self.descriptor_attempt(hub, &ctx, verb).await? {
                Attempt::Done => {
                    result = Ok(());
                    break;
                }
                Attempt::Retry(e) => result = Err(e),
            }
            self.msleep(100).await;
        }
        result?;

        let descriptor = self.read_device(udev, |d| d.descriptor)?;
        if speed.is_superspeed() && descriptor.usb_version < 0x0300 {
            error!("device {udev}: got a wrong device descriptor, warm reset device");
            let _ = self
                .hub_port_reset(hub, port, Some(udev), HUB_BH_RESET_TIME, true)
                .await;
            return Err(USBError::InvalidArgument("SuperSpeed device with USB 2.0 descriptor"));
        }

        let mps0 = descriptor.max_packet_size_0;
        let want = if mps0 == 0xff || speed.is_superspeed() {
            512
        } else {
            mps0 as u16
        };
        if want != ep0 {
            if speed == DeviceSpeed::Low || !matches!(want, 8 | 16 | 32 | 64) {
                error!("device {udev}: invalid ep0 maxpacket: {want}");
                return Err(USBError::Protocol("invalid ep0 maxpacket"));
            }
            if speed == DeviceSpeed::Full {
                debug!("device {udev}: ep0 maxpacket = {want}");
            } else {
                warn!("device {udev}: using ep0 maxpacket: {want}");
            }
            self.update_device(udev, |d| d.ep0_max_packet = want)?;
        }

        match self
            .get_device_descriptor(udev, DeviceDescriptor::LEN)
            .await
        {
            Ok(n) if n >= DeviceDescriptor::LEN => {}
            Ok(n) => {
                error!("device {udev}: device descriptor read/all, got {n} bytes");
                return Err(USBError::Protocol("short device descriptor"));
            }
            Err(e) => {
                if !is_gone(&e) {
                    error!("device {udev}: device descriptor read/all, error {e}");
                }
                return Err(e);
            }
        }

        let usb_version = self.read_device(udev, |d| d.descriptor.usb_version)?;
        if !wusb && usb_version >= 0x0201 {
            match self.get_bos_descriptor(udev).await {
                Ok(bos) => {
                    let capable = self.device_supports_lpm(udev, &bos);
                    self.update_device(udev, |d| d.lpm_capable = capable)?;
                    self.set_lpm_parameters(udev);
                }
                Err(e) => debug!("device {udev}: no BOS descriptor: {e}"),
            }
        }

        if caps.contains(HcCapabilities::UPDATE_DEVICE) {
            let target = self.target(udev)?;
            if let Err(e) = self.hc.update_device(&target).await {
                debug!("device {udev}: update_device failed: {e}");
            }
        }
        Ok(())
    }

    /// 一次读取设备描述符前缀的尝试
    ///
    /// 外层 `Err` 表示必须放弃本次初始化，`Retry` 表示还可以再试。
    async fn descriptor_attempt(&self, hub: &Hub, ctx: &InitContext, verb: &str) -> Result<Attempt> {
        let udev = ctx.udev;
        if ctx.use_new_scheme {
            let (probe, mps0, vendor) = self.probe_ep0(udev).await;
            self.update_device(udev, |d| d.descriptor.max_packet_size_0 = mps0)?;

            if vendor != self.config.no_second_reset_vendor {
                self.hub_port_reset(hub, ctx.port, Some(udev), ctx.delay, false)
                    .await?;
                let speed = self.read_device(udev, |d| d.speed)?;
                if speed != Some(ctx.speed) {
                    debug!("device {udev}: device reset changed speed!");
                    return Err(USBError::DeviceGone);
                }
            }

            if let Err(e) = probe {
                if is_gone(&e) {
                    return Ok(Attempt::Retry(e));
                }
                error!("device {udev}: device descriptor read/64, error {e}");
                return Ok(Attempt::Retry(USBError::Protocol("device descriptor read/64")));
            }
        }

        if !ctx.wusb {
            let mut result = Err(USBError::Busy);
            for _ in 0..SET_ADDRESS_TRIES {
                result = self.hub_set_address(udev, ctx.devnum).await;
                if result.is_ok() {
                    break;
                }
                self.msleep(200).await;
            }
            if let Err(e) = result {
                if !is_gone(&e) {
                    error!(
                        "device {udev}: device not accepting address {}, error {e}",
                        ctx.devnum
                    );
                }
                return Err(e);
            }
            if ctx.speed.is_superspeed() {
                let devnum = self.read_device(udev, |d| d.devnum)?;
                info!(
                    "{verb} SuperSpeed USB device number {devnum}, hub {} port {}",
                    hub.hdev, ctx.port
                );
            }

            // SET_ADDRESS 之后设备有 2ms 恢复时间
            self.msleep(10).await;
            if ctx.use_new_scheme {
                return Ok(Attempt::Done);
            }
        }

        match self.get_device_descriptor(udev, 8).await {
            Ok(n) if n >= 8 => Ok(Attempt::Done),
            Ok(n) => {
                error!("device {udev}: device descriptor read/8, got {n} bytes");
                Ok(Attempt::Retry(USBError::Protocol("device descriptor read/8")))
            }
            Err(e) => {
                if !is_gone(&e) {
                    error!("device {udev}: device descriptor read/8, error {e}");
                }
                Ok(Attempt::Retry(e))
            }
        }
    }

    /// 在地址 0 上读 64 字节设备描述符，最多三次
    ///
    /// 返回 (结果, bMaxPacketSize0, idVendor)。传输报错但内容合法时也算成功。
    async fn probe_ep0(&self, udev: DeviceId) -> (Result, u8, u16) {
        let mut buf = [0u8; GET_DESCRIPTOR_BUFSIZE];
        let mut result = Ok(());
        for _ in 0..3 {
            buf[7] = 0;
            let r = self
                .get_descriptor(udev, DescriptorType::Device, 0, &mut buf)
                .await;
            let valid = matches!(buf[7], 8 | 16 | 32 | 64 | 255)
                && buf[1] == u8::from(DescriptorType::Device);
            result = match r {
                _ if valid => Ok(()),
                Ok(_) => Err(USBError::Protocol("bad device descriptor")),
                Err(e) => Err(e),
            };
            if result.is_ok() {
                break;
            }
        }
        (result, buf[7], u16::from_le_bytes([buf[8], buf[9]]))
    }

    /// 低/全速设备挂在高速 Hub 下时需要 TT
    fn setup_tt(&self, hub: &Hub, udev: DeviceId, port: u8, speed: DeviceSpeed) -> Result {
        let (parent_tt, parent_speed) = self.read_device(hub.hdev, |d| (d.tt, d.speed))?;
        let tt = match parent_tt {
            Some(tt) => Some(tt),
            None if speed != DeviceSpeed::High && parent_speed == Some(DeviceSpeed::High) => {
                if !hub.tt.present {
                    // 重试也不会出现 TT
                    error!("device {udev}: parent hub has no TT");
                    return Err(USBError::NotSupported);
                }
                Some(TtLink {
                    hub: hub.hdev,
                    port,
                    multi: hub.tt.multi,
                    think_time_ns: hub.tt.think_time_ns,
                })
            }
            None => None,
        };
        self.update_device(udev, |d| d.tt = tt)
    }

    /// 给处于 `Default` 状态的设备分配地址
    pub(crate) async fn hub_set_address(&self, udev: DeviceId, devnum: u8) -> Result {
        let address_device = self.caps().contains(HcCapabilities::ADDRESS_DEVICE);
        if !address_device && devnum <= 1 {
            return Err(USBError::InvalidArgument("invalid device address"));
        }
        match self.device_state(udev) {
            DeviceState::Address => return Ok(()),
            DeviceState::Default => {}
            DeviceState::NotAttached => return Err(USBError::DeviceGone),
            _ => return Err(USBError::InvalidArgument("device is not in default state")),
        }

        if address_device {
            let target = self.target(udev)?;
            self.hc.address_device(&target, devnum).await?;
        } else {
            self.control_out(
                udev,
                ControlSetup {
                    request_type: RequestType::Standard,
                    recipient: Recipient::Device,
                    request: Request::SetAddress,
                    value: devnum as u16,
                    index: 0,
                },
                &[],
            )
            .await?;
        }
        self.update_devnum(udev, devnum)?;
        self.set_device_state(udev, DeviceState::Address);
        Ok(())
    }
}
