use hearth_cli::App;
use hearth_decode::CancellationToken;
use hearth_runtime::TinyModelSpec;
use hearth_store::StoreError;

fn app_in(dir: &tempfile::TempDir) -> App {
    App::new(dir.path()).with_user(Some("anna".into()))
}

#[tokio::test]
async fn import_list_and_delete_documents() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_in(&dir);
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "First paragraph.\n\nSecond paragraph.").unwrap();

    let doc = app.import(&file).await.unwrap();
    assert_eq!(doc.chunks.len(), 1);

    // A fresh App over the same home sees the stored corpus.
    let listed = App::new(dir.path()).documents().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, doc.id);

    app.delete_document(&doc.id.to_string()).await.unwrap();
    assert!(app.documents().await.unwrap().is_empty());
    assert!(app.delete_document(&doc.id.to_string()).await.is_err());
    assert!(app.delete_document("not-a-uuid").await.is_err());
}

#[tokio::test]
async fn whoami_round_trips_and_backs_commands() {
    let dir = tempfile::tempdir().unwrap();
    let anonymous = App::new(dir.path());

    assert_eq!(anonymous.whoami().await.unwrap(), None);
    let err = anonymous.history().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::IdentityRequired)
    ));

    let user = anonymous.set_user(" bob ").await.unwrap();
    assert_eq!(user.as_str(), "bob");
    assert_eq!(anonymous.whoami().await.unwrap(), Some(user));
    assert_eq!(anonymous.history().await.unwrap().len(), 1);
    assert!(anonymous.set_user("   ").await.is_err());
}

#[tokio::test]
async fn ask_without_model_explains_init() {
    let dir = tempfile::tempdir().unwrap();
    let err = app_in(&dir)
        .ask("hi", None, CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("hearth init-model"));
}

#[tokio::test]
async fn ask_answers_and_persists_with_tiny_model() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_in(&dir);
    app.init_model(None, &TinyModelSpec::default()).unwrap();

    let file = dir.path().join("rules.txt");
    std::fs::write(&file, "Rule one: keep the hearth warm.").unwrap();
    app.import(&file).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let reply = app
        .ask("What is rule one?", Some(600), CancellationToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(!reply.is_apology(), "{:?}", reply.error);
    assert!(reply.context.is_some());

    let mut streamed = String::new();
    while let Ok(piece) = rx.try_recv() {
        streamed.push_str(&piece);
    }
    assert!(!streamed.contains('*'));

    let history = app.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "What is rule one?");

    app.clear_history().await.unwrap();
    let after = app.history().await.unwrap();
    assert_eq!(after.len(), 1);
    assert!(!after[0].from_user);
}

#[tokio::test]
async fn too_small_budget_is_saved_as_apology() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_in(&dir);
    app.init_model(None, &TinyModelSpec::default()).unwrap();

    let reply = app
        .ask("hello", Some(8), CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(reply.is_apology());
    assert_eq!(app.history().await.unwrap()[1].text, reply.answer.text);
}
