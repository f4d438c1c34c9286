// 分片规划
//
// 规则：
// - 分片数 = ceil(file_size / chunk_size)
// - 除最后一片外，每片长度都是 chunk_size
// - 空文件规划为一个长度为 0 的分片，远端仍需一个分片才能完成会话
// - 分片序号从 1 开始连续编号

use crate::uploader::UploadError;
use std::ops::Range;
use tracing::debug;

/// 单个分片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    /// 文件内起始偏移
    pub offset: u64,
    /// 分片长度
    pub length: u64,
}

impl UploadPart {
    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// 一个会话的分片计划
#[derive(Debug, Clone)]
pub struct PartPlan {
    parts: Vec<UploadPart>,
    total_size: u64,
    chunk_size: u64,
}

impl PartPlan {
    pub fn parts(&self) -> &[UploadPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 按并发上限切成若干批，批内并发、批间串行
    ///
    /// `limit` 为 0 时按 1 处理
    pub fn waves(&self, limit: usize) -> impl Iterator<Item = &[UploadPart]> {
        self.parts.chunks(limit.max(1))
    }

    /// 批次数量
    pub fn wave_count(&self, limit: usize) -> usize {
        self.parts.len().div_ceil(limit.max(1))
    }
}

/// 规划分片
pub fn plan_parts(file_size: u64, chunk_size: u64) -> Result<PartPlan, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidInput("chunk_size 必须大于 0".to_string()));
    }

    let parts = if file_size == 0 {
        vec![UploadPart {
            part_number: 1,
            offset: 0,
            length: 0,
        }]
    } else {
        let count = file_size.div_ceil(chunk_size);
        if count > u32::MAX as u64 {
            return Err(UploadError::InvalidInput(format!(
                "分片数量过多: {} (file_size={}, chunk_size={})",
                count, file_size, chunk_size
            )));
        }

        let mut parts = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        let mut part_number = 1u32;
        while offset < file_size {
            let end = (offset + chunk_size).min(file_size);
            parts.push(UploadPart {
                part_number,
                offset,
                length: end - offset,
            });
            offset = end;
            part_number += 1;
        }
        parts
    };

    debug!(
        "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size,
        chunk_size,
        parts.len()
    );

    Ok(PartPlan {
        parts,
        total_size: file_size,
        chunk_size,
    })
}
