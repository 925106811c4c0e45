use async_trait::async_trait;

use crate::{
    error::ArchiveError,
    handle::store::{ArchiveStore, SourceStore},
    model::job::DatabaseGroup,
};

// 一个数据库组独占的两条连接
pub struct GroupConnections<S, A> {
    pub source: S,
    pub archive: A,
}

impl<S: SourceStore, A: ArchiveStore> GroupConnections<S, A> {
    pub fn new(source: S, archive: A) -> Self {
        GroupConnections { source, archive }
    }

    // 关闭两条连接
    pub async fn close(self) {
        self.source.close().await;
        self.archive.close().await;
    }
}

// 为一个数据库组打开源库和归档库连接，连接归调用方所有
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    type Source: SourceStore + 'static;
    type Archive: ArchiveStore + 'static;

    async fn open(
        &self,
        group: &DatabaseGroup,
    ) -> Result<GroupConnections<Self::Source, Self::Archive>, ArchiveError>;
}
