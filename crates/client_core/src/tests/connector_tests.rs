use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use shared::{
    domain::DataStats,
    error::{ErrorCode, ProtocolError, RejectReason, RemoteError},
    protocol::{pcm, ClientEvent, ClientProp, ChannelProp, Response, UserProp, VoiceChunk},
};

use super::*;
use crate::{error::ErrorCategory, voice::VoiceFrame};

type Slot = Arc<Mutex<Option<Link>>>;

fn connector_with(settings: Settings) -> (Connector, Slot, mpsc::UnboundedReceiver<InboundVoice>) {
    let slot: Slot = Arc::default();
    let launched = slot.clone();
    let (connector, streams) = Connector::with_queued_playback(settings, move |link| {
        *launched.lock().expect("slot") = Some(link);
    });
    (connector, slot, streams)
}

fn connector() -> (Connector, Slot, mpsc::UnboundedReceiver<InboundVoice>) {
    connector_with(Settings::default())
}

fn take_background(slot: &Slot) -> Link {
    slot.lock().expect("slot").take().expect("background launched")
}

async fn next_request(background: &mut Link) -> Request {
    let envelope = tokio::time::timeout(Duration::from_secs(2), background.recv())
        .await
        .expect("request in time")
        .expect("link open");
    match envelope {
        Envelope::Request(request) => request,
        other => panic!("expected a request, got {other:?}"),
    }
}

fn push_client(client_id: u32, prop: ClientProp) -> Envelope {
    Envelope::Property(PropertyPush::Client {
        client_id: ClientId(client_id),
        prop,
    })
}

/// Plays the background side of a successful connect for client 1.
async fn accept_connect(background: &mut Link) {
    let request = next_request(background).await;
    assert!(matches!(
        request.call,
        Call::Connector(ConnectorCall::Connect { .. })
    ));
    for envelope in [
        Envelope::Property(PropertyPush::Channel {
            client_id: ClientId(1),
            channel_id: ChannelId(0),
            prop: ChannelProp::Name("Root".into()),
        }),
        Envelope::Property(PropertyPush::User {
            client_id: ClientId(1),
            user_id: UserId(5),
            prop: UserProp::Channel(Some(ChannelId(0))),
        }),
        push_client(1, ClientProp::Root(ChannelId(0))),
        push_client(1, ClientProp::SelfUser(UserId(5))),
        Envelope::Response(Response::ok(
            request.req_id,
            ResponseValue::Client(ClientId(1)),
        )),
    ] {
        background.send(envelope).await.expect("push");
    }
}

async fn connected() -> (Connector, Link, mpsc::UnboundedReceiver<InboundVoice>) {
    let (mut connector, slot, streams) = connector();
    connector.start().expect("start");
    let mut background = take_background(&slot);
    let init = next_request(&mut background).await;
    assert_eq!(
        init.call,
        Call::Connector(ConnectorCall::Init {
            sample_rate: 48_000
        })
    );

    let (client_id, ()) = tokio::join!(
        async {
            connector
                .connect("example.org", ConnectArgs::default())
                .await
                .expect("connect")
        },
        accept_connect(&mut background),
    );
    assert_eq!(client_id, ClientId(1));
    (connector, background, streams)
}

#[tokio::test]
async fn background_starts_lazily_with_an_init_request() {
    let (mut connector, slot, _streams) = connector_with(Settings {
        sample_rate: 44_100,
        ..Settings::default()
    });
    assert!(!connector.is_started());
    assert!(slot.lock().expect("slot").is_none());

    let req_id = connector
        .call(Call::Connector(ConnectorCall::Init {
            sample_rate: 44_100,
        }))
        .expect("call");
    assert!(connector.is_started());

    let mut background = take_background(&slot);
    let init = next_request(&mut background).await;
    assert_eq!(
        init.call,
        Call::Connector(ConnectorCall::Init {
            sample_rate: 44_100
        })
    );
    assert!(init.req_id < req_id);
    assert_eq!(next_request(&mut background).await.req_id, req_id);
}

#[tokio::test]
async fn connect_materializes_the_client_from_pushes() {
    let (connector, _background, _streams) = connected().await;
    let client = connector.client(ClientId(1)).expect("client mirror");
    assert_eq!(client.root().map(|c| c.name.as_str()), Some("Root"));
    assert_eq!(client.self_user().map(|u| u.id), Some(UserId(5)));
    assert_eq!(client.users_in(ChannelId(0)).len(), 1);
    assert_eq!(connector.pending_requests(), 0);
}

#[tokio::test]
async fn rejected_connect_surfaces_the_remote_error() {
    let (mut connector, slot, _streams) = connector();
    connector.start().expect("start");
    let mut background = take_background(&slot);
    next_request(&mut background).await;

    let (result, ()) = tokio::join!(
        connector.connect("example.org", ConnectArgs::default()),
        async {
            let request = next_request(&mut background).await;
            let error = RemoteError::from(RejectReason::WrongServerPassword);
            background
                .send(Envelope::Response(Response::err(request.req_id, error)))
                .await
                .expect("respond");
        },
    );

    let err = result.expect_err("rejected");
    assert!(matches!(&err, ConnectorError::Remote(remote) if remote.code == ErrorCode::Rejected));
    assert_eq!(err.category(), ErrorCategory::Auth);
    assert!(connector.client(ClientId(1)).is_none());
}

#[tokio::test]
async fn responses_resolve_only_their_own_query() {
    let (mut connector, mut background, _streams) = connected().await;

    let fire_and_forget = connector
        .user_calls(ClientId(1), UserId(5))
        .expect("user calls")
        .set_mute(true)
        .expect("send");
    assert_eq!(connector.pending_requests(), 0);

    let (outcome, ()) = tokio::join!(
        connector.query(Call::Client {
            client_id: ClientId(1),
            call: ClientCall::SetSelfDeaf(true),
        }),
        async {
            let muted = next_request(&mut background).await;
            assert_eq!(muted.req_id, fire_and_forget);
            let deafened = next_request(&mut background).await;

            // The fire-and-forget failure arrives first and must not resolve the query.
            background
                .send(Envelope::Response(Response::err(
                    muted.req_id,
                    RemoteError::not_found("unknown user 5"),
                )))
                .await
                .expect("respond");
            background
                .send(Envelope::Response(Response::ok(
                    deafened.req_id,
                    ResponseValue::Unit,
                )))
                .await
                .expect("respond");
        },
    );

    assert_eq!(outcome.expect("query"), ResponseValue::Unit);
    assert_eq!(connector.pending_requests(), 0);
}

#[tokio::test]
async fn pump_reports_a_closed_link_as_fatal() {
    let (mut connector, background, _streams) = connected().await;
    drop(background);

    let err = connector.pump().await.expect_err("closed");
    assert!(err.is_fatal());
    assert!(connector.client(ClientId(1)).is_none());
    assert!(connector.is_retired(ClientId(1)));
}

#[tokio::test]
async fn pump_after_link_loss_does_not_relaunch_the_background() {
    let (mut connector, slot, _streams) = connector();
    connector.start().expect("start");
    drop(take_background(&slot));

    let first = connector.pump().await.expect_err("closed");
    assert!(matches!(first, ConnectorError::ChannelClosed));
    let second = tokio::time::timeout(Duration::from_secs(2), connector.pump())
        .await
        .expect("pump returns without waiting")
        .expect_err("still closed");
    assert!(matches!(second, ConnectorError::ChannelClosed));
    assert!(!connector.is_started());
    assert!(slot.lock().expect("slot").is_none());
}

#[tokio::test]
async fn full_link_is_reported_without_blocking() {
    let (mut connector, _slot, _streams) = connector_with(Settings {
        link_capacity: 2,
        ..Settings::default()
    });
    connector
        .call(Call::Connector(ConnectorCall::Init {
            sample_rate: 48_000,
        }))
        .expect("init and call fit");
    let err = connector
        .call(Call::Connector(ConnectorCall::Init {
            sample_rate: 48_000,
        }))
        .expect_err("queue full");
    assert!(matches!(err, ConnectorError::QueueFull));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn invoke_rejects_unsupported_methods_before_sending() {
    let (mut connector, mut background, _streams) = connected().await;
    let key = EntityKey::User {
        client_id: ClientId(1),
        user_id: UserId(5),
    };

    let err = connector
        .invoke(key, "kick", &[json!("bye")])
        .expect_err("unsupported");
    assert!(matches!(
        err,
        ConnectorError::Protocol(ProtocolError::UnsupportedMethod { .. })
    ));
    let err = connector
        .invoke(key, "setMute", &[json!("loud")])
        .expect_err("bad argument");
    assert!(matches!(
        err,
        ConnectorError::Protocol(ProtocolError::InvalidArguments { .. })
    ));
    assert_eq!(connector.drain().expect("drain"), 0);

    connector
        .invoke(key, "setChannel", &[json!(0)])
        .expect("supported");
    let request = next_request(&mut background).await;
    assert_eq!(
        request.call,
        Call::User {
            client_id: ClientId(1),
            user_id: UserId(5),
            call: UserCall::SetChannel(ChannelId(0)),
        }
    );
}

#[tokio::test]
async fn disconnect_retires_the_client_and_drops_late_pushes() {
    let (mut connector, mut background, _streams) = connected().await;
    let mut signals = connector.subscribe_client(ClientId(1)).expect("subscribe");

    connector
        .invoke(EntityKey::Client { client_id: ClientId(1) }, "disconnect", &[])
        .expect("disconnect");
    let request = next_request(&mut background).await;
    assert_eq!(
        request.call,
        Call::Client {
            client_id: ClientId(1),
            call: ClientCall::Disconnect,
        }
    );

    background
        .send(push_client(1, ClientProp::DataStats(DataStats::default())))
        .await
        .expect("late push");
    connector.pump().await.expect("pump");

    assert!(connector.client(ClientId(1)).is_none());
    assert!(connector.is_retired(ClientId(1)));
    assert!(signals.recv().await.is_none());
    assert!(matches!(
        connector.client_calls(ClientId(1)),
        Err(ConnectorError::UnknownClient(ClientId(1)))
    ));
}

#[tokio::test]
async fn user_voice_reaches_playback_with_its_origin() {
    let (mut connector, background, mut streams) = connected().await;
    let mut user_events = connector
        .subscribe_user(ClientId(1), UserId(5))
        .expect("subscribe");

    let voice_id = VoiceId(1);
    for envelope in [
        Envelope::Event(EventPush::User {
            client_id: ClientId(1),
            user_id: UserId(5),
            event: UserEvent::Voice { voice_id },
        }),
        Envelope::Voice(VoiceChunk::data(
            voice_id,
            pcm::encode(&[0.5, 0.25]),
            Some(VoiceTarget::Whisper),
        )),
        Envelope::Voice(VoiceChunk::end(voice_id)),
    ] {
        background.send(envelope).await.expect("push");
    }
    for _ in 0..3 {
        connector.pump().await.expect("pump");
    }

    assert_eq!(
        user_events.try_recv().expect("voice event"),
        UserEvent::Voice { voice_id }
    );
    let mut stream = streams.try_recv().expect("playback stream");
    assert_eq!(
        stream.origin,
        Some(VoiceOrigin {
            client_id: ClientId(1),
            user_id: UserId(5),
        })
    );
    assert_eq!(
        stream.frames.recv().await,
        Some(VoiceFrame {
            samples: vec![0.5, 0.25],
            target: Some(VoiceTarget::Whisper),
        })
    );
    assert_eq!(stream.frames.recv().await, None);
}

#[tokio::test]
async fn outbound_voice_announces_stream_before_audio() {
    let (mut connector, mut background, _streams) = connected().await;
    connector
        .client_calls(ClientId(1))
        .expect("client calls")
        .set_audio_quality(24_000, 2)
        .expect("quality");
    assert_eq!(
        connector
            .client(ClientId(1))
            .map(|client| client.audio_quality.bitrate),
        Some(24_000)
    );

    let mut voice = connector
        .create_voice_stream(ClientId(1), VoiceTarget::Shout)
        .expect("voice stream");
    voice.write(&[0.1; 4]).expect("write");
    voice.finish().expect("finish");

    next_request(&mut background).await;
    let create = next_request(&mut background).await;
    assert_eq!(
        create.call,
        Call::Client {
            client_id: ClientId(1),
            call: ClientCall::CreateVoiceStream {
                voice_id: VoiceId(1),
                samples_per_packet: 480,
                target: VoiceTarget::Shout,
            },
        }
    );
    let data = background.recv().await.expect("data chunk");
    assert!(matches!(data, Envelope::Voice(ref chunk) if !chunk.is_end()));
    assert_eq!(
        background.recv().await,
        Some(Envelope::Voice(VoiceChunk::end(VoiceId(1))))
    );
}

#[tokio::test]
async fn client_signals_include_property_changes_and_errors() {
    let (mut connector, background, _streams) = connected().await;
    let mut signals = connector.subscribe_client(ClientId(1)).expect("subscribe");

    let failure = RemoteError::new(ErrorCode::Internal, "codec reset");
    background
        .send(push_client(1, ClientProp::MaxBandwidth(Some(72_000))))
        .await
        .expect("push");
    background
        .send(Envelope::Event(EventPush::Client {
            client_id: ClientId(1),
            event: ClientEvent::Error(failure.clone()),
        }))
        .await
        .expect("push");
    assert_eq!(connector.drain().expect("drain"), 2);

    assert_eq!(
        signals.try_recv().expect("property"),
        ClientSignal::PropertyChanged(ClientProp::MaxBandwidth(Some(72_000)))
    );
    assert_eq!(
        signals.try_recv().expect("error"),
        ClientSignal::Event(ClientEvent::Error(failure))
    );
}

#[tokio::test]
async fn voice_of_a_disconnected_client_is_not_played() {
    let (mut connector, background, mut streams) = connected().await;
    connector.disconnect(ClientId(1)).expect("disconnect");

    let voice_id = VoiceId(4);
    for envelope in [
        Envelope::Event(EventPush::User {
            client_id: ClientId(1),
            user_id: UserId(5),
            event: UserEvent::Voice { voice_id },
        }),
        Envelope::Voice(VoiceChunk::data(
            voice_id,
            pcm::encode(&[0.5; 8]),
            Some(VoiceTarget::Normal),
        )),
        Envelope::Voice(VoiceChunk::end(voice_id)),
    ] {
        background.send(envelope).await.expect("push");
    }
    assert_eq!(connector.drain().expect("drain"), 3);
    assert!(streams.try_recv().is_err());
}
