pub mod dht {
    tonic::include_proto!("dht");
}

use crate::RingMember;

impl From<RingMember> for dht::Member {
    fn from(member: RingMember) -> Self {
        dht::Member {
            id: member.id,
            endpoint: member.address,
        }
    }
}

impl From<&RingMember> for dht::Member {
    fn from(member: &RingMember) -> Self {
        dht::Member {
            id: member.id,
            endpoint: member.address.clone(),
        }
    }
}

impl From<dht::Member> for RingMember {
    fn from(member: dht::Member) -> Self {
        RingMember {
            id: member.id,
            address: member.endpoint,
        }
    }
}

impl From<crate::dht::QueryResult> for dht::QueryResponse {
    fn from(result: crate::dht::QueryResult) -> Self {
        dht::QueryResponse {
            found: result.data.is_some(),
            data: result.data.unwrap_or_default(),
            responsible_node_id: result.responsible.id,
            responsible_node_endpoint: result.responsible.address,
        }
    }
}

impl From<dht::QueryResponse> for crate::dht::QueryResult {
    fn from(response: dht::QueryResponse) -> Self {
        crate::dht::QueryResult {
            data: response.found.then_some(response.data),
            responsible: RingMember::new(
                response.responsible_node_id,
                response.responsible_node_endpoint,
            ),
        }
    }
}
