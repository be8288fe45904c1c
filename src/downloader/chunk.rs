use std::ops::Range;
use tracing::{debug, info};

/// 默认最小拆分大小: 1MB，小于该值的文件单连接下载
pub const DEFAULT_MIN_SPLIT_SIZE: u64 = 1024 * 1024;

/// 默认单个分片最小大小: 256KB
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// 分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片策略
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy {
    /// 小于该大小不拆分
    pub min_split_size: u64,
    /// 拆分后每个分片至少这么大
    pub min_chunk_size: u64,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            min_split_size: DEFAULT_MIN_SPLIT_SIZE,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
        }
    }
}

/// 分片计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPlan {
    /// 按 Range 并发下载，分片互不重叠且恰好覆盖 [0, total)
    Ranged { total: u64, chunks: Vec<Chunk> },
    /// 单连接整体下载
    ///
    /// `expected` 为已知大小（流式下载时为 None），
    /// `resumable` 表示服务器支持 Range，重试时可以从断点续传
    Whole {
        expected: Option<u64>,
        resumable: bool,
    },
}

impl ChunkPlan {
    /// 根据探测结果生成分片计划
    pub fn build(
        total: Option<u64>,
        range_capable: bool,
        concurrency: usize,
        policy: &PlanPolicy,
    ) -> Self {
        let total = match total {
            Some(total) if range_capable => total,
            _ => {
                debug!(
                    "单连接下载: 大小={:?}, 支持Range={}",
                    total, range_capable
                );
                return ChunkPlan::Whole {
                    expected: total,
                    resumable: range_capable && total.is_some(),
                };
            }
        };

        if total < policy.min_split_size || concurrency <= 1 {
            debug!(
                "文件较小或并发数为1，不拆分: 大小={} bytes, 并发={}",
                total, concurrency
            );
            return ChunkPlan::Whole {
                expected: Some(total),
                resumable: true,
            };
        }

        let max_by_size = (total / policy.min_chunk_size.max(1)).max(1) as usize;
        let count = concurrency.min(max_by_size);
        let chunks = split_range(total, count);

        info!(
            "创建分片计划: 文件大小={} bytes, 分片数量={}",
            total,
            chunks.len()
        );

        ChunkPlan::Ranged { total, chunks }
    }

    /// 连接数
    pub fn connection_count(&self) -> usize {
        match self {
            ChunkPlan::Ranged { chunks, .. } => chunks.len(),
            ChunkPlan::Whole { .. } => 1,
        }
    }

    /// 计划开始前即可确定的总大小
    pub fn known_total(&self) -> Option<u64> {
        match self {
            ChunkPlan::Ranged { total, .. } => Some(*total),
            ChunkPlan::Whole { expected, .. } => *expected,
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        match self {
            ChunkPlan::Ranged { chunks, .. } => chunks,
            ChunkPlan::Whole { .. } => &[],
        }
    }
}

/// 把 [0, total) 切成 `count` 个近似相等的连续区间，最后一个分片吸收余数
///
/// `count` 会被限制在 [1, total] 内；total 为 0 时返回空列表
pub fn split_range(total: u64, count: usize) -> Vec<Chunk> {
    if total == 0 {
        return Vec::new();
    }

    let count = (count.max(1) as u64).min(total);
    let base = total / count;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for index in 0..count {
        let end = if index == count - 1 { total } else { offset + base };
        chunks.push(Chunk::new(index as usize, offset..end));
        offset = end;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_creation() {
        let chunk = Chunk::new(0, 0..1024);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.range.start, 0);
        assert_eq!(chunk.range.end, 1024);
        assert_eq!(chunk.size(), 1024);
    }

    #[test]
    fn test_split_remainder_goes_to_last() {
        let chunks = split_range(105, 10);
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[0].range, 0..10);
        assert_eq!(chunks[9].range, 90..105);
        assert_eq!(chunks[9].size(), 15);
    }

    #[test]
    fn test_split_more_connections_than_bytes() {
        let chunks = split_range(3, 8);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.size() == 1));
        assert!(split_range(0, 4).is_empty());
    }

    #[test]
    fn test_ten_megabytes_four_connections() {
        let plan = ChunkPlan::build(Some(10 * MB), true, 4, &PlanPolicy::default());
        assert_eq!(plan.connection_count(), 4);
        assert_eq!(plan.known_total(), Some(10 * MB));
        for chunk in plan.chunks() {
            assert_eq!(chunk.size(), 10 * MB / 4);
        }
    }

    #[test]
    fn test_fallback_when_range_unsupported() {
        let plan = ChunkPlan::build(Some(10 * MB), false, 4, &PlanPolicy::default());
        assert_eq!(
            plan,
            ChunkPlan::Whole {
                expected: Some(10 * MB),
                resumable: false
            }
        );
    }

    #[test]
    fn test_fallback_when_size_unknown() {
        let plan = ChunkPlan::build(None, true, 4, &PlanPolicy::default());
        assert_eq!(
            plan,
            ChunkPlan::Whole {
                expected: None,
                resumable: false
            }
        );
        assert_eq!(plan.connection_count(), 1);
        assert!(plan.chunks().is_empty());
    }

    #[test]
    fn test_small_file_single_connection() {
        let plan = ChunkPlan::build(Some(MB - 1), true, 8, &PlanPolicy::default());
        assert_eq!(
            plan,
            ChunkPlan::Whole {
                expected: Some(MB - 1),
                resumable: true
            }
        );
    }

    #[test]
    fn test_min_chunk_size_limits_connection_count() {
        // 1MB / 256KB = 4 个分片上限
        let plan = ChunkPlan::build(Some(MB), true, 16, &PlanPolicy::default());
        assert_eq!(plan.connection_count(), 4);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn assert_partition(chunks: &[Chunk], total: u64) -> Result<(), TestCaseError> {
            let mut expected_start = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.range.start, expected_start);
                prop_assert!(chunk.range.end > chunk.range.start);
                expected_start = chunk.range.end;
            }
            prop_assert_eq!(expected_start, total);
            Ok(())
        }

        proptest! {
            #[test]
            fn split_partitions_exactly(total in 0u64..10_000_000_000_000, count in 1usize..128) {
                let chunks = split_range(total, count);
                if total == 0 {
                    prop_assert!(chunks.is_empty());
                } else {
                    prop_assert_eq!(chunks.len() as u64, (count as u64).min(total));
                }
                assert_partition(&chunks, total)?;
            }

            #[test]
            fn plan_partitions_exactly(total in 0u64..100_000_000_000, concurrency in 1usize..64) {
                let plan = ChunkPlan::build(Some(total), true, concurrency, &PlanPolicy::default());
                match plan {
                    ChunkPlan::Ranged { total: planned, chunks } => {
                        prop_assert_eq!(planned, total);
                        prop_assert!(chunks.len() <= concurrency);
                        assert_partition(&chunks, total)?;
                    }
                    ChunkPlan::Whole { expected, .. } => {
                        prop_assert_eq!(expected, Some(total));
                    }
                }
            }
        }
    }
}
