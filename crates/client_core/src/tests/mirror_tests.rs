use shared::protocol::TextMessage;

use super::*;

fn client() -> ClientMirror {
    let mut client = ClientMirror::new(ClientId(1));
    client.apply_property(ClientProp::Root(ChannelId(0)));
    client.apply_channel_property(ChannelId(0), ChannelProp::Name("Root".into()));
    for (id, name) in [(1, "Lobby"), (2, "Music"), (3, "Games")] {
        client.apply_channel_property(ChannelId(id), ChannelProp::Parent(Some(ChannelId(0))));
        client.apply_channel_property(ChannelId(id), ChannelProp::Name(name.into()));
    }
    client.apply_user_property(UserId(5), UserProp::Channel(Some(ChannelId(1))));
    client
}

#[test]
fn mirrors_are_created_once_per_identity() {
    let mut client = client();
    client.channel_entry(ChannelId(2)).position = 7;
    assert_eq!(client.channel_entry(ChannelId(2)).position, 7);
    assert_eq!(client.channels().filter(|c| c.id == ChannelId(2)).count(), 1);
    assert_eq!(client.channel(ChannelId(2)).map(|c| c.name.as_str()), Some("Music"));
}

#[test]
fn parent_resolution_follows_the_latest_push() {
    let mut client = client();
    assert_eq!(client.parent_of(ChannelId(3)).map(|c| c.id), Some(ChannelId(0)));

    client.handle_channel_event(
        ChannelId(3),
        ChannelEvent::Update {
            actor: None,
            changes: vec![ChannelProp::Parent(Some(ChannelId(1)))],
        },
    );
    assert_eq!(client.parent_of(ChannelId(3)).map(|c| c.id), Some(ChannelId(1)));
    let children: Vec<_> = client.children_of(ChannelId(1)).iter().map(|c| c.id).collect();
    assert_eq!(children, vec![ChannelId(3)]);
    assert_eq!(client.children_of(ChannelId(0)).len(), 2);
}

#[test]
fn links_materialize_referenced_channels() {
    let mut client = client();
    client.apply_channel_property(ChannelId(2), ChannelProp::Links(vec![ChannelId(3), ChannelId(9)]));

    let links: Vec<_> = client.links_of(ChannelId(2)).iter().map(|c| c.id).collect();
    assert_eq!(links, vec![ChannelId(3), ChannelId(9)]);
    assert!(client.channel(ChannelId(9)).is_some());
}

#[test]
fn remove_drops_the_mirror_and_resolution_yields_none() {
    let mut client = client();
    let mut events = client.channel_entry(ChannelId(2)).subscribe();
    client.handle_channel_event(ChannelId(2), ChannelEvent::Remove);

    assert!(client.channel(ChannelId(2)).is_none());
    assert!(client.children_of(ChannelId(0)).iter().all(|c| c.id != ChannelId(2)));
    assert_eq!(events.try_recv().expect("remove emitted"), ChannelEvent::Remove);

    // A later reference creates a fresh mirror without the old state.
    let fresh = client.channel_entry(ChannelId(2));
    assert!(fresh.name.is_empty());
    assert_eq!(fresh.subscriber_count(), 0);
}

#[test]
fn user_channel_update_moves_the_user() {
    let mut client = client();
    assert_eq!(client.channel_of_user(UserId(5)).map(|c| c.id), Some(ChannelId(1)));

    let mut events = client.user_entry(UserId(5)).subscribe();
    let update = UserEvent::Update {
        actor: Some(UserId(6)),
        changes: vec![UserProp::Channel(Some(ChannelId(3)))],
    };
    client.handle_user_event(UserId(5), update.clone());

    assert_eq!(client.channel_of_user(UserId(5)).map(|c| c.id), Some(ChannelId(3)));
    let in_games: Vec<_> = client.users_in(ChannelId(3)).iter().map(|u| u.id).collect();
    assert_eq!(in_games, vec![UserId(5)]);
    assert!(client.users_in(ChannelId(1)).is_empty());
    assert!(client.user(UserId(6)).is_some());
    assert_eq!(events.try_recv().expect("update emitted"), update);
}

#[test]
fn null_unique_id_stays_none() {
    let mut client = client();
    client.handle_client_event(ClientEvent::NewUser(UserId(8)));
    client.apply_user_property(UserId(8), UserProp::UniqueId(None));
    client.apply_user_property(UserId(8), UserProp::Username("guest".into()));

    let user = client.user(UserId(8)).expect("user mirror");
    assert_eq!(user.unique_id, None);
    assert_eq!(user.username, "guest");
}

#[test]
fn client_subscribers_see_events_and_property_changes() {
    let mut client = client();
    let mut signals = client.subscribe();
    let dropped = client.subscribe();
    drop(dropped);

    client.apply_property(ClientProp::MaxBandwidth(Some(72_000)));
    let message = TextMessage {
        sender: Some(UserId(5)),
        text: "hello".into(),
        users: Vec::new(),
        channels: vec![ChannelId(1)],
        trees: Vec::new(),
    };
    client.handle_client_event(ClientEvent::Message(message.clone()));

    assert_eq!(
        signals.try_recv().expect("property"),
        ClientSignal::PropertyChanged(ClientProp::MaxBandwidth(Some(72_000)))
    );
    assert_eq!(
        signals.try_recv().expect("message"),
        ClientSignal::Event(ClientEvent::Message(message))
    );
    assert_eq!(client.subscribers.len(), 1);
}

#[test]
fn bitrate_accounts_for_packet_overhead() {
    let mut client = ClientMirror::new(ClientId(1));
    assert_eq!(client.max_bitrate(480, false), None);
    assert_eq!(client.actual_bitrate(480, false), DEFAULT_BITRATE);

    // 36 bytes per 10 ms packet.
    assert_eq!(enforceable_bandwidth(0, 480, false), 28_800);
    // Two frames per packet halve the packet rate; positional data adds 12 bytes.
    assert_eq!(enforceable_bandwidth(0, 960, true), (20 + 8 + 4 + 1 + 2 + 12 + 2) * 400);

    client.apply_property(ClientProp::MaxBandwidth(Some(60_000)));
    assert_eq!(client.max_bitrate(480, false), Some(31_200));
    assert_eq!(client.actual_bitrate(480, false), 31_200);

    client.audio_quality.bitrate = 24_000;
    assert_eq!(client.actual_bitrate(480, false), 24_000);
}
