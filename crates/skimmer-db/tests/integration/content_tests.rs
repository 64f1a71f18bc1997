use skimmer_core::models::{ExtractedContent, MediaItem, NewContent, NewMedia, compute_hash};
use skimmer_core::traits::ContentStore;
use skimmer_db::ContentRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn extracted(title: &str) -> ExtractedContent {
    ExtractedContent {
        kind: "article".into(),
        title: Some(title.into()),
        content: format!("# {title}"),
        media: vec![
            MediaItem {
                kind: "image".into(),
                url: "https://cdn.example.com/a.jpg".into(),
                alt: Some("A".into()),
            },
            MediaItem {
                kind: "video".into(),
                url: "https://cdn.example.com/b.mp4".into(),
                alt: None,
            },
        ],
        success: true,
        errors: Vec::new(),
    }
}

#[tokio::test]
async fn save_and_retrieve_content() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);

    let job_id = Uuid::new_v4();
    let new = NewContent::from_extracted(job_id, "https://example.com/a", &extracted("Hello"));
    let id = repo.save_content(new).await.unwrap();
    assert!(!id.is_nil());

    let stored = repo.get(id).await.unwrap().expect("Should find the content");
    assert_eq!(stored.job_id, job_id);
    assert_eq!(stored.url, "https://example.com/a");
    assert_eq!(stored.kind, "article");
    assert_eq!(stored.title.as_deref(), Some("Hello"));
    assert_eq!(stored.content, "# Hello");
    assert_eq!(stored.content_hash, compute_hash("# Hello"));
}

#[tokio::test]
async fn get_latest_returns_most_recent() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);

    let url = "https://example.com/a";
    repo.save_content(NewContent::from_extracted(Uuid::new_v4(), url, &extracted("First")))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = repo
        .save_content(NewContent::from_extracted(Uuid::new_v4(), url, &extracted("Second")))
        .await
        .unwrap();

    let latest = repo.get_latest(url).await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert_eq!(latest.title.as_deref(), Some("Second"));

    assert!(repo.get_latest("https://other.com").await.unwrap().is_none());
}

#[tokio::test]
async fn media_attached_to_content() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);

    let content = extracted("Gallery");
    let id = repo
        .save_content(NewContent::from_extracted(
            Uuid::new_v4(),
            "https://example.com/g",
            &content,
        ))
        .await
        .unwrap();
    for item in &content.media {
        repo.save_media(NewMedia::from_item(id, item)).await.unwrap();
    }

    let media = repo.list_media(id).await.unwrap();
    assert_eq!(media, content.media);
    assert!(repo.list_media(Uuid::new_v4()).await.unwrap().is_empty());
}

#[tokio::test]
async fn media_requires_existing_content() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);

    let orphan = NewMedia {
        content_id: Uuid::new_v4(),
        kind: "image".into(),
        url: "https://cdn.example.com/x.jpg".into(),
        alt: None,
    };
    let err = repo.save_media(orphan).await.unwrap_err();
    assert!(matches!(err, skimmer_core::AppError::DatabaseError(_)));
}

#[tokio::test]
async fn saving_twice_for_one_job_keeps_a_single_row() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    let job_id = Uuid::new_v4();
    let url = "https://example.com/retry";

    let content = extracted("Retried");
    let first = repo
        .save_content(NewContent::from_extracted(job_id, url, &content))
        .await
        .unwrap();
    for item in &content.media {
        repo.save_media(NewMedia::from_item(first, item)).await.unwrap();
    }

    let second = repo
        .save_content(NewContent::from_extracted(job_id, url, &extracted("Retried again")))
        .await
        .unwrap();
    for item in &content.media {
        repo.save_media(NewMedia::from_item(second, item)).await.unwrap();
    }

    assert_eq!(first, second);
    let latest = repo.get_latest(url).await.unwrap().unwrap();
    assert_eq!(latest.title.as_deref(), Some("Retried again"));
    assert_eq!(repo.list_media(first).await.unwrap(), content.media);
}
