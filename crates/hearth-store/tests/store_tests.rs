use std::io::Write;

use chrono::Utc;
use hearth_store::{
    ChatHistoryStore, ChatTurn, Chunk, CorpusStore, Document, FileChatStore, FileCorpusStore,
    FileIdentityStore, IdentityStore, MemoryChatStore, StoreError, StoreLayout, UserId,
};

fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

fn doc(text: &str, embedding: Vec<f32>) -> Document {
    Document::new(
        text,
        vec![Chunk {
            text: text.to_string(),
            embedding,
        }],
    )
}

async fn append_get_clear(store: &dyn ChatHistoryStore) {
    let u1 = user("u1");
    let t1 = ChatTurn::user("t1", Utc::now());
    let t2 = ChatTurn::assistant("t2", Utc::now());

    store.append(&u1, t1.clone()).await.unwrap();
    store.append(&u1, t2.clone()).await.unwrap();
    assert_eq!(store.get(&u1).await.unwrap(), vec![t1, t2]);

    store.clear(&u1).await.unwrap();
    assert!(store.get(&u1).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_append_get_clear_in_memory() {
    append_get_clear(&MemoryChatStore::new()).await;
}

#[tokio::test]
async fn history_append_get_clear_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileChatStore::open(dir.path().join("history.jsonl")).unwrap();
    append_get_clear(&store).await;
}

#[tokio::test]
async fn history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("history.jsonl");
    let now = Utc::now();
    let turns = vec![ChatTurn::user("frage", now), ChatTurn::assistant("antwort", now)];

    {
        let store = FileChatStore::open(path.clone()).unwrap();
        store.append_all(&user("anna"), turns.clone()).await.unwrap();
        store
            .append(&user("ben"), ChatTurn::user("hallo", now))
            .await
            .unwrap();
    }

    let reopened = FileChatStore::open(path).unwrap();
    assert_eq!(reopened.get(&user("anna")).await.unwrap(), turns);
    assert_eq!(reopened.get(&user("ben")).await.unwrap().len(), 1);

    reopened.clear_all().await.unwrap();
    assert!(reopened.get(&user("anna")).await.unwrap().is_empty());
    assert!(reopened.get(&user("ben")).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_skips_corrupted_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let good = serde_json::json!({
        "user": "anna",
        "turn": {
            "id": "6f1c1f5e-8e51-4a8b-9a4b-1c2d3e4f5a6b",
            "text": "valid",
            "from_user": true,
            "timestamp": "2026-01-01T00:00:00Z"
        }
    });
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "{good}").unwrap();
    writeln!(file, "this is not json").unwrap();
    writeln!(file, r#"{{"user":"","turn":null}}"#).unwrap();
    writeln!(file).unwrap();
    drop(file);

    let store = FileChatStore::open(path).unwrap();
    let turns = store.get(&user("anna")).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].text, "valid");
}

#[tokio::test]
async fn corpus_put_list_delete_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corpus.jsonl");
    let a = doc("Par. 5 regelt X.", vec![1.0, 0.0]);
    let b = doc("Par. 6 regelt Y.", vec![0.0, 1.0]);

    {
        let store = FileCorpusStore::open(path.clone()).unwrap();
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();
        assert!(store.delete(a.id).await.unwrap());
    }

    let reopened = FileCorpusStore::open(path).unwrap();
    assert_eq!(reopened.list().await.unwrap(), vec![b.clone()]);
    assert_eq!(reopened.get(b.id).await.unwrap(), Some(b));
    assert!(reopened.get(a.id).await.unwrap().is_none());
    assert!(!reopened.delete(a.id).await.unwrap());
}

#[tokio::test]
async fn failed_write_leaves_entries_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    let history = FileChatStore::open(blocker.join("history.jsonl")).unwrap();
    let corpus = FileCorpusStore::open(blocker.join("corpus.jsonl")).unwrap();
    // A regular file where the parent directory should be makes every flush fail.
    std::fs::write(&blocker, b"not a directory").unwrap();

    let u = user("anna");
    let turn = ChatTurn::user("lost", Utc::now());
    assert!(history.append(&u, turn).await.is_err());
    assert!(history.get(&u).await.unwrap().is_empty());

    assert!(corpus.put(doc("lost", vec![1.0])).await.is_err());
    assert!(corpus.list().await.unwrap().is_empty());

    // Writes go through again once the directory can be created.
    std::fs::remove_file(&blocker).unwrap();
    history
        .append(&u, ChatTurn::user("kept", Utc::now()))
        .await
        .unwrap();
    let turns = FileChatStore::open(blocker.join("history.jsonl"))
        .unwrap()
        .get(&u)
        .await
        .unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].text, "kept");
}

#[tokio::test]
async fn missing_files_start_empty() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = FileCorpusStore::open(dir.path().join("none.jsonl")).unwrap();
    assert!(corpus.list().await.unwrap().is_empty());
    let history = FileChatStore::open(dir.path().join("none2.jsonl")).unwrap();
    assert!(history.get(&user("x")).await.unwrap().is_empty());
}

#[tokio::test]
async fn identity_file_roundtrip_keeps_other_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

    let store = FileIdentityStore::new(path.clone());
    assert!(store.get().await.unwrap().is_none());

    store.set(&user("clara")).await.unwrap();
    assert_eq!(store.get().await.unwrap(), Some(user("clara")));

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["theme"], "dark");
    assert_eq!(raw["user_name"], "clara");

    store.delete().await.unwrap();
    assert!(store.get().await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_identity_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "not json").unwrap();
    let store = FileIdentityStore::new(path);
    assert!(matches!(store.get().await, Err(StoreError::Json(_))));
}

#[test]
fn layout_is_rooted() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path());
    assert!(layout.history_path().starts_with(layout.root()));
}
