//! 增强记录本地模型与向量编解码

/// 嵌入向量维度，必须与存储列的声明维度一致，不一致的写入直接失败
pub const EMBEDDING_DIM: usize = 4096;

/// 单条消息的增强结果
#[derive(Debug, Clone)]
pub struct LocalEnrichedMessage {
    pub chat_id: i64,
    pub message_id: i64,
    /// 目标消息之前的对话上下文归纳
    pub context: String,
    /// 目标消息本身的语义归纳
    pub meaning: String,
    /// 定长嵌入向量
    pub embedding: Vec<f32>,
}

/// 向量编码为小端 f32 字节串（BLOB 列的存储格式）
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// 从小端 f32 字节串还原向量
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
