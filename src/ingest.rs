use crate::catalog::{CatalogError, CatalogRecord, CatalogStore};
use crate::requests::{MovieRequest, RequestLedger};
use crate::validate;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("post has no usable title")]
    NoTitle,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub record: CatalogRecord,
    /// Заявки, которые закрыл этот пост.
    pub approved: Vec<MovieRequest>,
}

/// Пост из канала-источника → каталог → автоодобрение заявок.
/// Порядок строгий: append (внутри сбрасывает кэш), потом auto_approve по тому же названию.
pub async fn ingest_post(
    catalog: &CatalogStore,
    requests: &RequestLedger,
    channel_id: i64,
    message_id: i32,
    text: &str,
) -> Result<IngestOutcome, IngestError> {
    let Some(title) = validate::clean_caption(text) else {
        debug!(channel_id, message_id, "post skipped: no title");
        return Err(IngestError::NoTitle);
    };
    let record = catalog.append(&title, message_id, channel_id).await?;

    // запись уже в каталоге; сбой леджера заявок её не откатывает
    let approved = match requests.auto_approve(record.movie_name()).await {
        Ok(approved) => approved,
        Err(e) => {
            error!(error = %e, movie = %record.movie_name(), "auto-approve failed");
            Vec::new()
        }
    };
    Ok(IngestOutcome { record, approved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSettings;
    use crate::channels::ChannelDirectory;
    use crate::requests::{Moderator, RequestSettings, RequestStatus};
    use tempfile::TempDir;

    fn stores(dir: &TempDir) -> (CatalogStore, RequestLedger) {
        let channels = ChannelDirectory::new(&[-100], &[-200]).unwrap();
        let catalog = CatalogStore::new(CatalogSettings::in_dir(dir.path()), channels);
        let requests = RequestLedger::new(RequestSettings::in_dir(dir.path()));
        (catalog, requests)
    }

    #[tokio::test]
    async fn ingesting_a_post_approves_matching_request() {
        let dir = TempDir::new().unwrap();
        let (catalog, requests) = stores(&dir);
        let pending = requests.submit(42, "Pathaan", "Raj").await.unwrap();
        let before = catalog.get_cached().await.unwrap().records.len();

        let outcome = ingest_post(&catalog, &requests, -200, 77, "🎬 Pathaan (2023) HD\n#hindi")
            .await
            .unwrap();
        assert_eq!(outcome.record.movie_name(), "Pathaan (2023) HD");
        assert_eq!(outcome.approved.len(), 1);

        let stored = requests.get(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(stored.approved_by, Some(Moderator::System));

        // кэш сброшен append-ом: новая запись сразу ищется
        assert_eq!(catalog.get_cached().await.unwrap().records.len(), before + 1);
        assert_eq!(catalog.search("pathaan").await.unwrap()[0].count(), 1);
    }

    #[tokio::test]
    async fn posts_without_title_or_from_unknown_channel_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (catalog, requests) = stores(&dir);
        assert!(matches!(
            ingest_post(&catalog, &requests, -100, 1, "🔥🔥 https://t.me/x").await,
            Err(IngestError::NoTitle)
        ));
        let unknown = ingest_post(&catalog, &requests, -555, 1, "Animal").await.unwrap_err();
        assert!(matches!(unknown, IngestError::Catalog(CatalogError::UnknownChannel(-555))));
        assert_eq!(catalog.pending().await, 0);
    }
}
