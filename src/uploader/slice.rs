// 上传分片规划
//
// 服务端单次上传会话最多接受 10_000 个分片；
// 超出时放大分片尺寸而不是拒绝上传。

use std::ops::Range;

/// 默认分片大小: 80MB
///
/// 分片 >= 100MB 时上传速率明显下降
pub const DEFAULT_SLICE_SIZE: u64 = 80 * 1024 * 1024;

/// 单个上传会话的分片数上限（服务端限制）
pub const MAX_PART_NUMBER: u64 = 10_000;

/// 调整分片大小，保证分片数不超过 10_000
pub fn adjust_slice_size(slice_size: u64, io_len: u64) -> u64 {
    let slice_size = slice_size.max(1);
    let part_number = io_len.div_ceil(slice_size);
    if part_number > MAX_PART_NUMBER {
        io_len.div_ceil(MAX_PART_NUMBER)
    } else {
        slice_size
    }
}

/// 一个文件的分片计划
#[derive(Debug, Clone)]
pub struct SlicePlan {
    io_len: u64,
    slice_size: u64,
}

impl SlicePlan {
    /// 按名义分片大小生成计划（自动满足 10_000 上限）
    pub fn new(io_len: u64, nominal_slice_size: u64) -> Self {
        SlicePlan {
            io_len,
            slice_size: adjust_slice_size(nominal_slice_size, io_len),
        }
    }

    pub fn io_len(&self) -> u64 {
        self.io_len
    }

    /// 实际生效的分片大小
    pub fn slice_size(&self) -> u64 {
        self.slice_size
    }

    /// 分片数（空文件按 1 个空分片处理，服务端要求 part_number >= 1）
    pub fn part_number(&self) -> u32 {
        self.io_len.div_ceil(self.slice_size).max(1) as u32
    }

    /// 按偏移顺序产出各分片的字节范围
    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        let count = self.part_number() as u64;
        (0..count).map(move |i| {
            let start = i * self.slice_size;
            let end = (start + self.slice_size).min(self.io_len);
            start..end
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_adjust_noop_when_under_cap() {
        assert_eq!(adjust_slice_size(DEFAULT_SLICE_SIZE, 100), DEFAULT_SLICE_SIZE);
        assert_eq!(adjust_slice_size(4 * 1024 * 1024, 100 * 1024 * 1024), 4 * 1024 * 1024);
    }

    #[test]
    fn test_adjust_grows_when_over_cap() {
        // 1 字节分片上传 1MB 会产生 1_048_576 个分片，必须放大
        let adjusted = adjust_slice_size(1, 1024 * 1024);
        let parts = (1024u64 * 1024).div_ceil(adjusted);
        assert!(parts <= MAX_PART_NUMBER);
    }

    #[test]
    fn test_plan_single_slice() {
        let plan = SlicePlan::new(5, DEFAULT_SLICE_SIZE);
        assert_eq!(plan.part_number(), 1);
        let ranges: Vec<_> = plan.ranges().collect();
        assert_eq!(ranges, vec![0..5]);
    }

    #[test]
    fn test_plan_empty_file() {
        let plan = SlicePlan::new(0, DEFAULT_SLICE_SIZE);
        assert_eq!(plan.part_number(), 1);
        let ranges: Vec<_> = plan.ranges().collect();
        assert_eq!(ranges, vec![0..0]);
    }

    #[test]
    fn test_plan_ranges_cover_exactly() {
        let plan = SlicePlan::new(17, 4);
        assert_eq!(plan.part_number(), 5);
        let ranges: Vec<_> = plan.ranges().collect();
        assert_eq!(ranges[0], 0..4);
        assert_eq!(ranges[4], 16..17);

        // 首尾相接且总长等于文件长
        let total: u64 = ranges.iter().map(|r| r.end - r.start).sum();
        assert_eq!(total, 17);
        for w in ranges.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    proptest! {
        /// part_number == ceil(io_len / 生效分片) 且永不超过 10_000
        #[test]
        fn prop_part_number_invariant(
            io_len in 1u64..(1u64 << 40),
            slice_size in 1u64..(1u64 << 30),
        ) {
            let plan = SlicePlan::new(io_len, slice_size);
            let eff = plan.slice_size();
            prop_assert_eq!(plan.part_number() as u64, io_len.div_ceil(eff));
            prop_assert!((plan.part_number() as u64) <= MAX_PART_NUMBER);
        }

        /// 分片范围有序相接、并集恰好覆盖整个文件
        #[test]
        fn prop_ranges_partition(
            io_len in 1u64..(1u64 << 28),
            slice_size in 1u64..(1u64 << 22),
        ) {
            let plan = SlicePlan::new(io_len, slice_size);
            let ranges: Vec<_> = plan.ranges().collect();
            prop_assert_eq!(ranges.first().unwrap().start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, io_len);
            for w in ranges.windows(2) {
                prop_assert_eq!(w[0].end, w[1].start);
            }
        }
    }
}
