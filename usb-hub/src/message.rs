//! 标准控制请求

use usb_if::{
    descriptor::{BosDescriptor, DescriptorType, DeviceDescriptor},
    host::ControlSetup,
    transfer::{Recipient, Request, RequestType},
};

use crate::{
    DeviceId,
    bus::Bus,
    err::{Result, USBError},
};

impl Bus {
    pub(crate) async fn control_in(
        &self,
        dev: DeviceId,
        setup: ControlSetup,
        buff: &mut [u8],
    ) -> Result<usize> {
        let target = self.target(dev)?;
        Ok(self.hc.control_in(&target, setup, buff).await?)
    }

    pub(crate) async fn control_out(
        &self,
        dev: DeviceId,
        setup: ControlSetup,
        buff: &[u8],
    ) -> Result<usize> {
        let target = self.target(dev)?;
        Ok(self.hc.control_out(&target, setup, buff).await?)
    }

    pub(crate) async fn get_descriptor(
        &self,
        dev: DeviceId,
        desc_type: DescriptorType,
        index: u8,
        buff: &mut [u8],
    ) -> Result<usize> {
        self.control_in(
            dev,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Device,
                request: Request::GetDescriptor,
                value: ((u8::from(desc_type) as u16) << 8) | index as u16,
                index: 0,
            },
            buff,
        )
        .await
    }

    /// 读取设备描述符的前 `len` 字节并合并到设备对象中
    ///
    /// 8 字节时只更新前缀（含 bMaxPacketSize0），18 字节时替换整个描述符。
    pub(crate) async fn get_device_descriptor(&self, dev: DeviceId, len: usize) -> Result<usize> {
        let mut buf = [0u8; DeviceDescriptor::LEN];
        let len = len.min(DeviceDescriptor::LEN);
        let n = self
            .get_descriptor(dev, DescriptorType::Device, 0, &mut buf[..len])
            .await?;
        if n >= DeviceDescriptor::LEN {
            let desc = DeviceDescriptor::parse(&buf).ok_or(USBError::Protocol(
                "malformed device descriptor",
            ))?;
            self.update_device(dev, |d| d.descriptor = desc)?;
        } else if n >= 8 {
            self.update_device(dev, |d| d.descriptor.update_prefix(&buf[..n]))?;
        }
        Ok(n)
    }

    /// 标准 GET_STATUS
    pub(crate) async fn get_status(
        &self,
        dev: DeviceId,
        recipient: Recipient,
        index: u16,
    ) -> Result<u16> {
        let mut buf = [0u8; 2];
        let n = self
            .control_in(
                dev,
                ControlSetup {
                    request_type: RequestType::Standard,
                    recipient,
                    request: Request::GetStatus,
                    value: 0,
                    index,
                },
                &mut buf,
            )
            .await?;
        if n < 2 {
            return Err(USBError::Protocol("short GET_STATUS"));
        }
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) async fn set_feature(
        &self,
        dev: DeviceId,
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result {
        self.feature_request(dev, Request::SetFeature, recipient, feature, index)
            .await
    }

    pub(crate) async fn clear_feature(
        &self,
        dev: DeviceId,
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result {
        self.feature_request(dev, Request::ClearFeature, recipient, feature, index)
            .await
    }

    async fn feature_request(
        &self,
        dev: DeviceId,
        request: Request,
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result {
        self.control_out(
            dev,
            ControlSetup {
                request_type: RequestType::Standard,
                recipient,
                request,
                value: feature,
                index,
            },
            &[],
        )
        .await?;
        Ok(())
    }

    /// 读取 BOS 描述符：先读 5 字节头部，再按总长度读取，结果记录到设备对象
    pub(crate) async fn get_bos_descriptor(&self, dev: DeviceId) -> Result<BosDescriptor> {
        let mut header = [0u8; BosDescriptor::HEADER_LEN];
        let n = self
            .get_descriptor(dev, DescriptorType::Bos, 0, &mut header)
            .await?;
        let total = BosDescriptor::total_length_of(&header[..n])
            .ok_or(USBError::Protocol("BOS descriptor header"))?;
        if (total as usize) < BosDescriptor::HEADER_LEN {
            return Err(USBError::Protocol("BOS descriptor too short"));
        }
        let mut raw = alloc::vec![0u8; total as usize];
        let n = self
            .get_descriptor(dev, DescriptorType::Bos, 0, &mut raw)
            .await?;
        let bos = BosDescriptor::parse(&raw[..n])
            .ok_or(USBError::Protocol("malformed BOS descriptor"))?;
        self.update_device(dev, |d| d.bos = Some(bos.clone()))?;
        Ok(bos)
    }
}
