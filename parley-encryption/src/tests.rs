// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_matches::assert_matches;

use crate::account::Account;
use crate::conversation_secret::{ConversationId, Distributor, Recipient};
use crate::crypto::Rng;
use crate::key_store::{KeyScope, MemoryBackend, SecureKeyStore};
use crate::message::{CodecError, MessageCodec, UNABLE_TO_DECRYPT};
use crate::pin::Pin;
use crate::rotation::{RotationEngine, RotationError, RotationRequest};
use crate::test_utils::{MemberId, MemoryTransport, TestMember, setup_logging, test_config};

type TestStore = SecureKeyStore<MemberId, MemoryBackend<MemberId>>;

#[tokio::test]
async fn rotation_after_member_removal() {
    setup_logging();
    let rng = Rng::from_seed([1; 32]);
    let conversation_id = ConversationId::new("band-practice");

    let alice = TestMember::new(0, &rng);
    let bob = TestMember::new(1, &rng);
    let charlie = TestMember::new(2, &rng);

    // Alice creates a conversation with Bob and Charlie.

    let (transport, s1) =
        MemoryTransport::with_conversation(&conversation_id, &[&alice, &bob, &charlie], &rng);
    let alice_store = TestStore::new(MemoryBackend::new());
    alice_store
        .put(&alice.id, &conversation_id.clone().into(), s1.secret_key())
        .await
        .unwrap();

    // Everyone receives the secret.

    let distribution = transport.latest_distribution(&conversation_id).unwrap();
    for member in [&alice, &bob, &charlie] {
        let received = Distributor::receive(&member.id, member.secret_key(), &distribution);
        assert_eq!(received.unwrap(), s1);
    }

    // Ten messages are written.

    for i in 0..10 {
        let sender = [&alice, &bob, &charlie][i % 3];
        let text = format!("message {i}");
        transport.post_text(&conversation_id, sender, &text, i as u64, &s1, &rng);
    }

    // Charlie gets removed and Alice rotates the conversation secret.

    let s2 = RotationEngine::rotate(
        RotationRequest {
            my_id: alice.id,
            conversation_id: conversation_id.clone(),
            old_secret: s1.clone(),
            participants: vec![alice.recipient(), bob.recipient()],
            min_date: 0,
        },
        &transport,
        &alice_store,
        &rng,
    )
    .await
    .unwrap();
    assert_ne!(s1, s2);

    // The new secret was only distributed to Alice and Bob.

    let distribution = transport.latest_distribution(&conversation_id).unwrap();
    assert_eq!(distribution.conversation_public_key(), s2.public_key());
    assert_eq!(
        distribution.recipients().copied().collect::<Vec<_>>(),
        vec![alice.id, bob.id]
    );
    assert_eq!(
        Distributor::receive(&bob.id, bob.secret_key(), &distribution).unwrap(),
        s2
    );
    assert!(Distributor::receive(&charlie.id, charlie.secret_key(), &distribution).is_err());

    // Alice adopted the new secret.

    let stored = Account::conversation_secret(&alice.id, &conversation_id, &alice_store)
        .await
        .unwrap();
    assert_eq!(stored, Some(s2.clone()));

    // All ten messages are readable with the new secret and not with the old one anymore.

    let messages = transport.messages(&conversation_id);
    assert_eq!(messages.len(), 10);
    for (i, message) in messages.into_iter().enumerate() {
        assert_matches!(
            MessageCodec::decrypt(message.clone(), s1.secret_key(), &s1.public_key()),
            Err(CodecError::DecryptionFailed)
        );
        let decrypted =
            MessageCodec::decrypt(message, s2.secret_key(), &s2.public_key()).unwrap();
        assert_eq!(decrypted.display_content(), format!("message {i}"));
    }
}

#[tokio::test]
async fn failed_commit_keeps_previous_secret() {
    setup_logging();
    let rng = Rng::from_seed([2; 32]);
    let conversation_id = ConversationId::new("band-practice");

    let alice = TestMember::new(0, &rng);
    let bob = TestMember::new(1, &rng);
    let charlie = TestMember::new(2, &rng);

    let (transport, s1) =
        MemoryTransport::with_conversation(&conversation_id, &[&alice, &bob, &charlie], &rng);
    let alice_store = TestStore::new(MemoryBackend::new());
    alice_store
        .put(&alice.id, &conversation_id.clone().into(), s1.secret_key())
        .await
        .unwrap();

    for i in 0..10 {
        let sender = [&alice, &bob, &charlie][i % 3];
        let text = format!("message {i}");
        transport.post_text(&conversation_id, sender, &text, i as u64, &s1, &rng);
    }

    // Charlie gets removed, but the backend rejects the rotation.

    transport.fail_publish_rotation(true);
    let result = RotationEngine::rotate(
        RotationRequest {
            my_id: alice.id,
            conversation_id: conversation_id.clone(),
            old_secret: s1.clone(),
            participants: vec![alice.recipient(), bob.recipient()],
            min_date: 0,
        },
        &transport,
        &alice_store,
        &rng,
    )
    .await;
    assert_matches!(result, Err(RotationError::Aborted(_)));

    // Alice still holds the old secret.

    let stored = Account::conversation_secret(&alice.id, &conversation_id, &alice_store)
        .await
        .unwrap();
    assert_eq!(stored, Some(s1.clone()));

    // Bob was told about the old secret again.

    let distribution = transport.latest_distribution(&conversation_id).unwrap();
    let bob_secret = Distributor::receive(&bob.id, bob.secret_key(), &distribution).unwrap();
    assert_eq!(bob_secret, s1);

    // History is still readable by Alice and Bob under the old secret.

    let messages = transport.messages(&conversation_id);
    let outcomes = MessageCodec::decrypt_all(messages, Some(&bob_secret));
    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|outcome| outcome.is_readable()));
}

#[tokio::test]
async fn mixed_mode_conversation() {
    setup_logging();
    let rng = Rng::from_seed([3; 32]);
    let conversation_id = ConversationId::new("lobby");

    let alice = TestMember::new(0, &rng);
    let bob = TestMember::new(1, &rng);

    // Three messages were written before encryption was enabled.

    let transport = MemoryTransport::new();
    transport.post_plain(&conversation_id, &alice, "one", 1);
    transport.post_plain(&conversation_id, &bob, "two", 2);
    transport.post_plain(&conversation_id, &alice, "three", 3);

    let secret = transport.create_conversation(&conversation_id, &[&alice, &bob], &rng);
    transport.post_text(&conversation_id, &bob, "four", 4, &secret, &rng);
    transport.post_text(&conversation_id, &alice, "five", 5, &secret, &rng);

    let messages = transport.messages(&conversation_id);

    // With the secret all five messages render.

    let outcomes = MessageCodec::decrypt_all(messages.clone(), Some(&secret));
    let rendered: Vec<&str> = outcomes.iter().map(|outcome| outcome.display_content()).collect();
    assert_eq!(rendered, vec!["one", "two", "three", "four", "five"]);

    // Without the secret plaintext messages still render, encrypted ones show the placeholder.

    let outcomes = MessageCodec::decrypt_all(messages, None);
    let rendered: Vec<&str> = outcomes.iter().map(|outcome| outcome.display_content()).collect();
    assert_eq!(
        rendered,
        vec!["one", "two", "three", UNABLE_TO_DECRYPT, UNABLE_TO_DECRYPT]
    );
}

#[tokio::test]
async fn recover_on_new_device_and_read_history() {
    setup_logging();
    let rng = Rng::from_seed([4; 32]);
    let config = test_config();
    let conversation_id = ConversationId::new("family");

    // Alice sets up her account with a PIN.

    let alice_id: MemberId = 0;
    let pin = Pin::new("482910", &config).unwrap();
    let phone = TestStore::new(MemoryBackend::new());
    let (identity, bundle) = Account::initialize(&alice_id, &pin, &phone, &config, &rng)
        .await
        .unwrap();
    let alice = TestMember {
        id: alice_id,
        identity,
    };
    let bob = TestMember::new(1, &rng);

    // Bob creates a conversation with Alice, she stores the secret and backs up her keys.

    let (transport, secret) =
        MemoryTransport::with_conversation(&conversation_id, &[&alice, &bob], &rng);
    transport.post_text(&conversation_id, &bob, "welcome!", 1, &secret, &rng);

    let distribution = transport.latest_distribution(&conversation_id).unwrap();
    let received = Distributor::receive(&alice.id, alice.secret_key(), &distribution).unwrap();
    let scope = KeyScope::Conversation(conversation_id.clone());
    phone
        .put(&alice.id, &scope, received.secret_key())
        .await
        .unwrap();
    let bundle = Account::backup(&alice.id, &pin, &bundle, &phone, &config, &rng)
        .await
        .unwrap();

    // The phone is lost, Alice signs in on her laptop and enters her PIN.

    Account::sign_out(&alice.id, &phone).await.unwrap();

    let laptop = TestStore::new(MemoryBackend::new());
    Account::recover(&alice.id, &pin, &bundle, &laptop, &config)
        .await
        .unwrap();
    let secret = Account::conversation_secret(&alice.id, &conversation_id, &laptop)
        .await
        .unwrap()
        .unwrap();

    let outcomes = MessageCodec::decrypt_all(transport.messages(&conversation_id), Some(&secret));
    assert_eq!(outcomes[0].display_content(), "welcome!");
}

#[tokio::test]
async fn add_member_and_partially_enabled_recipients() {
    setup_logging();
    let rng = Rng::from_seed([5; 32]);
    let conversation_id = ConversationId::new("c1");

    let alice = TestMember::new(0, &rng);
    let bob = TestMember::new(1, &rng);
    let dave = TestMember::new(3, &rng);

    let (transport, secret) =
        MemoryTransport::with_conversation(&conversation_id, &[&alice, &bob], &rng);
    transport.post_text(&conversation_id, &alice, "before dave", 1, &secret, &rng);

    // Dave joins, Erin has not set up encryption yet and is skipped.

    let distribution = Distributor::distribute(
        &secret,
        &[dave.recipient(), Recipient::without_key(4)],
        &rng,
    )
    .unwrap();
    assert_eq!(distribution.skipped(), &[4]);
    assert!(distribution.ensure_complete().is_err());

    let dave_secret = Distributor::receive(&dave.id, dave.secret_key(), &distribution).unwrap();

    // Dave reads the history.

    let outcomes =
        MessageCodec::decrypt_all(transport.messages(&conversation_id), Some(&dave_secret));
    assert_eq!(outcomes[0].display_content(), "before dave");
}
