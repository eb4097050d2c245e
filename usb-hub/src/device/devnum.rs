/// 总线地址位图
///
/// 地址 0 保留给尚未分配地址的设备，分配从上次分配的下一个开始循环查找。
#[derive(Debug, Clone)]
pub struct DevnumMap {
    map: u128,
    next: u8,
}

impl DevnumMap {
    pub const MAX: u8 = 127;

    pub const fn new() -> Self {
        Self { map: 0, next: 1 }
    }

    fn find_free(&self, from: u8) -> Option<u8> {
        (from.max(1)..=Self::MAX).find(|&n| !self.is_used(n))
    }

    /// 选择下一个空闲地址
    pub fn choose(&mut self) -> Option<u8> {
        let found = self.find_free(self.next).or_else(|| self.find_free(1));
        self.next = match found {
            Some(n) if n < Self::MAX => n + 1,
            _ => 1,
        };
        let n = found?;
        self.map |= 1u128 << n;
        Some(n)
    }

    /// 无线 USB 根 Hub 下地址固定为端口号 + 1
    pub fn choose_fixed(&mut self, devnum: u8) -> Option<u8> {
        if devnum == 0 || devnum > Self::MAX || self.is_used(devnum) {
            return None;
        }
        self.map |= 1u128 << devnum;
        Some(devnum)
    }

    /// 根 Hub 固定使用地址 1
    pub fn reserve_root(&mut self) {
        self.map |= 1u128 << 1;
        self.next = 2;
    }

    pub fn release(&mut self, devnum: u8) {
        if devnum > 0 && devnum <= Self::MAX {
            self.map &= !(1u128 << devnum);
        }
    }

    pub fn is_used(&self, devnum: u8) -> bool {
        devnum <= Self::MAX && self.map & (1u128 << devnum) != 0
    }

    pub fn used(&self) -> u32 {
        self.map.count_ones()
    }
}

impl Default for DevnumMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devnum_round_robin() {
        let mut map = DevnumMap::new();
        map.reserve_root();
        assert_eq!(map.choose(), Some(2));
        assert_eq!(map.choose(), Some(3));
        map.release(2);
        // 从上次分配之后继续，不立刻复用
        assert_eq!(map.choose(), Some(4));
        assert!(!map.is_used(2));
    }

    #[test]
    fn test_devnum_exhaustion_and_wrap() {
        let mut map = DevnumMap::new();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 1..=127 {
            let n = map.choose().unwrap();
            assert!((1..=127).contains(&n));
            assert!(seen.insert(n), "address {n} handed out twice");
        }
        assert_eq!(map.choose(), None);
        assert_eq!(map.used(), 127);

        map.release(42);
        assert_eq!(map.choose(), Some(42));
        assert!(map.is_used(42));
        assert!(!map.is_used(0));
    }

    #[test]
    fn test_devnum_fixed() {
        let mut map = DevnumMap::new();
        assert_eq!(map.choose_fixed(3), Some(3));
        assert_eq!(map.choose_fixed(3), None);
        assert_eq!(map.choose_fixed(0), None);
    }
}
