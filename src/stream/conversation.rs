use crate::flow::{Direction, FlowIdent, TransportProtocol};

use super::DataFragment;

/// Both directions of one flow interleaved by capture time.
///
/// Built exactly once per flow; decoders and writers receive it behind an
/// `Arc` and never mutate it.
#[derive(Debug, Clone)]
pub struct Conversation {
    ident: FlowIdent,
    transport: TransportProtocol,
    fragments: Vec<DataFragment>,
    first_client_packet: Option<i64>,
    first_server_packet: Option<i64>,
    client_bytes: usize,
    server_bytes: usize,
}

impl Conversation {
    /// Merge two per-direction fragment lists, each already in delivery
    /// order, by timestamp. Ties go to the client side. Order within a
    /// direction is always preserved.
    pub fn merge(
        ident: FlowIdent,
        transport: TransportProtocol,
        client: &[DataFragment],
        server: &[DataFragment],
    ) -> Self {
        let mut fragments = Vec::with_capacity(client.len() + server.len());
        let (mut c, mut s) = (0, 0);
        while c < client.len() && s < server.len() {
            if client[c].timestamp_us() <= server[s].timestamp_us() {
                fragments.push(client[c].clone());
                c += 1;
            } else {
                fragments.push(server[s].clone());
                s += 1;
            }
        }
        fragments.extend_from_slice(&client[c..]);
        fragments.extend_from_slice(&server[s..]);
        Self::from_ordered(ident, transport, fragments)
    }

    /// Build from fragments that are already in conversation order.
    pub fn from_ordered(
        ident: FlowIdent,
        transport: TransportProtocol,
        fragments: Vec<DataFragment>,
    ) -> Self {
        let mut conversation = Self {
            ident,
            transport,
            fragments: Vec::new(),
            first_client_packet: None,
            first_server_packet: None,
            client_bytes: 0,
            server_bytes: 0,
        };
        for fragment in &fragments {
            match fragment.direction() {
                Direction::ToServer => {
                    conversation.client_bytes += fragment.len();
                    conversation
                        .first_client_packet
                        .get_or_insert(fragment.timestamp_us());
                }
                Direction::ToClient => {
                    conversation.server_bytes += fragment.len();
                    conversation
                        .first_server_packet
                        .get_or_insert(fragment.timestamp_us());
                }
            }
        }
        conversation.fragments = fragments;
        conversation
    }

    /// Flow identity oriented client to server.
    pub fn ident(&self) -> &FlowIdent {
        &self.ident
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn fragments(&self) -> &[DataFragment] {
        &self.fragments
    }

    pub fn server_port(&self) -> u16 {
        self.ident.dst.port()
    }

    pub fn first_client_packet(&self) -> Option<i64> {
        self.first_client_packet
    }

    pub fn first_server_packet(&self) -> Option<i64> {
        self.first_server_packet
    }

    /// Earliest timestamp of either side.
    pub fn first_packet(&self) -> Option<i64> {
        self.fragments.first().map(DataFragment::timestamp_us)
    }

    pub fn client_bytes(&self) -> usize {
        self.client_bytes
    }

    pub fn server_bytes(&self) -> usize {
        self.server_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Leading bytes the client sent: its first fragment.
    pub fn first_client_fragment(&self) -> &[u8] {
        self.first_of(Direction::ToServer)
    }

    /// Leading bytes the server sent: its first fragment.
    pub fn first_server_fragment(&self) -> &[u8] {
        self.first_of(Direction::ToClient)
    }

    fn first_of(&self, direction: Direction) -> &[u8] {
        self.fragments
            .iter()
            .find(|f| f.direction() == direction)
            .map(DataFragment::data)
            .unwrap_or(&[])
    }

    /// All bytes sent in one direction, concatenated.
    pub fn stream(&self, direction: Direction) -> Vec<u8> {
        let capacity = match direction {
            Direction::ToServer => self.client_bytes,
            Direction::ToClient => self.server_bytes,
        };
        let mut out = Vec::with_capacity(capacity);
        for fragment in self.fragments.iter().filter(|f| f.direction() == direction) {
            out.extend_from_slice(fragment.data());
        }
        out
    }

    /// Every byte in conversation order.
    pub fn data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.client_bytes + self.server_bytes);
        for fragment in &self.fragments {
            out.extend_from_slice(fragment.data());
        }
        out
    }
}
