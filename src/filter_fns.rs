use nostr_types::{EventKind, Filter, PublicKeyHex};

/// The fixed kinds this runtime subscribes to: profile metadata,
/// follow lists, game annotations, admin declarations, admin keypairs.
pub fn subscribed_kinds() -> Vec<EventKind> {
    vec![
        EventKind::Metadata,
        EventKind::ContactList,
        EventKind::Other(31001),
        EventKind::Other(31106),
        EventKind::Other(31107),
    ]
}

/// The active filter set: a baseline filter over the subscribed kinds,
/// plus an author-restricted filter when we follow anybody.
pub fn main_filters(followed: &[PublicKeyHex], limit: usize) -> Vec<Filter> {
    let mut filters: Vec<Filter> = Vec::new();

    filters.push(Filter {
        kinds: subscribed_kinds(),
        limit: Some(limit),
        ..Default::default()
    });

    if !followed.is_empty() {
        filters.push(Filter {
            authors: followed.to_owned(),
            kinds: subscribed_kinds(),
            limit: Some(limit),
            ..Default::default()
        });
    }

    filters
}
