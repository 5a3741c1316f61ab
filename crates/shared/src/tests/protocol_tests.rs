use super::*;
use crate::error::ProtocolError;
use serde_json::json;

#[test]
fn parses_whitelisted_user_calls() {
    assert_eq!(
        UserCall::parse("setChannel", &[json!(3)]).expect("setChannel"),
        UserCall::SetChannel(ChannelId(3))
    );
    assert_eq!(
        UserCall::parse("requestTexture", &[]).expect("requestTexture"),
        UserCall::RequestTexture
    );
    assert_eq!(
        ClientCall::parse("setAudioQuality", &[json!(40000), json!(2)]).expect("quality"),
        ClientCall::SetAudioQuality {
            bitrate: 40000,
            frames_per_packet: 2,
        }
    );
}

#[test]
fn rejects_methods_outside_the_whitelist() {
    let err = UserCall::parse("kick", &[json!("bye")]).expect_err("kick is not proxied");
    assert_eq!(
        err,
        ProtocolError::UnsupportedMethod {
            entity: "user",
            method: "kick".to_string(),
        }
    );

    let err = ClientCall::parse("createVoiceStream", &[]).expect_err("needs a voice id");
    assert!(matches!(err, ProtocolError::UnsupportedMethod { .. }));
}

#[test]
fn rejects_badly_typed_arguments() {
    let err = UserCall::parse("setMute", &[json!("yes")]).expect_err("not a bool");
    assert!(matches!(err, ProtocolError::InvalidArguments { method, .. } if method == "setMute"));

    let err = ChannelCall::parse("sendMessage", &[]).expect_err("missing text");
    assert!(matches!(err, ProtocolError::InvalidArguments { .. }));
}

#[test]
fn call_key_selects_the_addressed_entity() {
    let call = Call::User {
        client_id: ClientId(1),
        user_id: UserId(5),
        call: UserCall::SetDeaf(true),
    };
    assert_eq!(
        call.key(),
        Some(EntityKey::User {
            client_id: ClientId(1),
            user_id: UserId(5),
        })
    );
    assert_eq!(call.method_name(), "setDeaf");

    let connect = Call::Connector(ConnectorCall::Connect {
        host: "example.org".into(),
        args: ConnectArgs::default(),
    });
    assert_eq!(connect.key(), None);
    assert_eq!(connect.method_name(), "_connect");
}

#[test]
fn envelope_json_carries_the_field_names_of_each_shape() {
    let push = Envelope::Property(PropertyPush::User {
        client_id: ClientId(1),
        user_id: UserId(5),
        prop: UserProp::UniqueId(None),
    });
    let value = serde_json::to_value(&push).expect("serialize");
    assert_eq!(value["type"], "property");
    assert_eq!(value["payload"]["user"]["prop"]["prop"], "uniqueId");
    assert!(value["payload"]["user"]["prop"]["value"].is_null());

    let decoded: Envelope = serde_json::from_value(value).expect("deserialize");
    assert_eq!(decoded, push);
}

#[test]
fn response_outcome_is_either_result_or_error() {
    let ok = Response::ok(RequestId(4), ResponseValue::Client(ClientId(1)));
    assert_eq!(ok.outcome.into_result(), Ok(ResponseValue::Client(ClientId(1))));

    let err = Response::err(RequestId(5), RemoteError::not_found("no such user"));
    let value = serde_json::to_value(&err).expect("serialize");
    assert!(value["outcome"].get("error").is_some());
    assert!(value["outcome"].get("result").is_none());
}

#[test]
fn voice_chunk_without_buffer_is_the_end_sentinel() {
    let end = VoiceChunk::end(VoiceId(9));
    assert!(end.is_end());
    let data = VoiceChunk::data(VoiceId(9), pcm::encode(&[0.5]), Some(VoiceTarget::Shout));
    assert!(!data.is_end());
}

#[test]
fn pcm_decode_ignores_partial_trailing_sample() {
    let mut raw = pcm::encode(&[0.25, -1.0]).to_vec();
    raw.push(0xff);
    assert_eq!(pcm::decode(&raw), vec![0.25, -1.0]);
}

#[test]
fn reject_reason_keeps_its_type_tag() {
    let remote = RemoteError::from(crate::error::RejectReason::ServerFull);
    assert_eq!(remote.kind.as_deref(), Some("ServerFull"));
    assert_eq!(remote.code, crate::error::ErrorCode::Rejected);
}
