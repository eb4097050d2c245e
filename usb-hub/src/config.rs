/// Hub 核心的可调参数
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 先用旧的枚举方式（SET_ADDRESS 后读 8 字节描述符）
    pub old_scheme_first: bool,
    /// 一种方式失败后再尝试另一种
    pub use_both_schemes: bool,
    /// 端口指示灯闪烁提示
    pub blinkenlights: bool,
    /// 新设备默认允许 reset-resume 保留状态
    pub persist_default: bool,
    /// 这个厂商的设备在 64 字节探测后不再做第二次复位
    pub no_second_reset_vendor: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            old_scheme_first: cfg!(feature = "old_scheme_first"),
            use_both_schemes: true,
            blinkenlights: false,
            persist_default: true,
            no_second_reset_vendor: 0x1a0a,
        }
    }
}

impl HubConfig {
    /// 一个端口的枚举尝试次数
    pub fn set_config_tries(&self) -> usize {
        2 * (self.use_both_schemes as usize + 1)
    }

    /// 第 `retry` 次尝试是否使用新的枚举方式
    pub fn use_new_scheme(&self, retry: usize) -> bool {
        (retry / 2 == 0) != self.old_scheme_first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_alternation() {
        let config = HubConfig {
            old_scheme_first: false,
            ..Default::default()
        };
        assert_eq!(config.set_config_tries(), 4);
        let schemes: Vec<bool> = (0..4).map(|i| config.use_new_scheme(i)).collect();
        assert_eq!(schemes, [true, true, false, false]);

        let config = HubConfig {
            old_scheme_first: true,
            use_both_schemes: false,
            ..Default::default()
        };
        assert_eq!(config.set_config_tries(), 2);
        assert!(!config.use_new_scheme(0));
        assert!(!config.use_new_scheme(1));
    }
}
