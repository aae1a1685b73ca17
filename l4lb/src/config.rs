use serde::Deserialize;

use l4lb_common::{RealFlags, VipFlags, VipKey, DEFAULT_CH_RING_SIZE};
use network_types::ip::IpProto;
use std::net::IpAddr;

use crate::error::{LbError, LbResult};
use crate::hash::RendezvousHasher;
use crate::lb::{LoadBalancer, ModifyAction, NewReal};
use crate::quic::QuicReal;

/// Sizing and feature switches of the control plane.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LbConfig {
    /// Slots per VIP ring; a power of two.
    pub ch_ring_size: u32,
    pub max_vips: u32,
    pub max_reals: u32,
    pub max_decap_dsts: u32,
    pub max_healthcheck_dsts: u32,
    pub max_src_routing_rules: u32,
    /// Pinned flows kept by the reference datapath.
    pub flow_cache_size: u32,
    pub tcp_server_id_routing: bool,
    pub optional_counters: bool,
}

impl Default for LbConfig {
    fn default() -> Self {
        LbConfig {
            ch_ring_size: DEFAULT_CH_RING_SIZE,
            max_vips: 512,
            max_reals: 4096,
            max_decap_dsts: 6,
            max_healthcheck_dsts: 1024,
            max_src_routing_rules: 4096,
            flow_cache_size: 65536,
            tcp_server_id_routing: false,
            optional_counters: true,
        }
    }
}

impl LbConfig {
    pub fn validate(&self) -> LbResult<()> {
        RendezvousHasher::new(self.ch_ring_size)?;
        if self.max_vips == 0 || self.max_reals == 0 {
            return Err(LbError::InvalidConfiguration(
                "max_vips and max_reals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Deserialize, Clone, Copy)]
pub struct RealServer {
    pub addr: IpAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub local: bool,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Vip {
    pub vip: IpAddr,
    pub port: u16,
    #[serde(deserialize_with = "deserialize_ip_proto")]
    pub proto: IpProto,
    #[serde(default, deserialize_with = "deserialize_vip_flags")]
    pub flags: VipFlags,
    #[serde(default)]
    pub real_servers: Vec<RealServer>,
}

impl Vip {
    pub fn key(&self) -> VipKey {
        VipKey::new(self.vip, self.port, self.proto)
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct SrcRoutingRule {
    pub srcs: Vec<String>,
    pub dst: IpAddr,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct HealthcheckDst {
    pub id: u32,
    pub addr: IpAddr,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lb: LbConfig,
    #[serde(default)]
    pub vips: Vec<Vip>,
    #[serde(default)]
    pub quic_mappings: Vec<QuicReal>,
    #[serde(default)]
    pub src_routing: Vec<SrcRoutingRule>,
    #[serde(default)]
    pub inline_decap_dsts: Vec<IpAddr>,
    #[serde(default)]
    pub healthcheck_dsts: Vec<HealthcheckDst>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}

fn deserialize_ip_proto<'de, D>(deserializer: D) -> Result<IpProto, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Proto {
        Number(u8),
        Name(String),
    }

    match Proto::deserialize(deserializer)? {
        Proto::Number(6) => Ok(IpProto::Tcp),
        Proto::Number(17) => Ok(IpProto::Udp),
        Proto::Name(name) if name.eq_ignore_ascii_case("tcp") => Ok(IpProto::Tcp),
        Proto::Name(name) if name.eq_ignore_ascii_case("udp") => Ok(IpProto::Udp),
        Proto::Number(n) => Err(Error::custom(format!("unsupported vip protocol {}", n))),
        Proto::Name(name) => Err(Error::custom(format!("unsupported vip protocol {}", name))),
    }
}

fn vip_flag(name: &str) -> Option<VipFlags> {
    let flag = match name {
        "no_src_port" => VipFlags::NO_SRC_PORT,
        "lru_bypass" => VipFlags::LRU_BYPASS,
        "quic" => VipFlags::QUIC,
        "dport_hash" => VipFlags::DPORT_HASH,
        "src_routing" => VipFlags::SRC_ROUTING,
        "local_vip" => VipFlags::LOCAL_VIP,
        "udp_stable_routing" => VipFlags::UDP_STABLE_ROUTING,
        "udp_flow_migration" => VipFlags::UDP_FLOW_MIGRATION,
        _ => return None,
    };
    Some(flag)
}

fn deserialize_vip_flags<'de, D>(deserializer: D) -> Result<VipFlags, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let names = Vec::<String>::deserialize(deserializer)?;
    names.iter().try_fold(VipFlags::NONE, |acc, name| {
        vip_flag(name)
            .map(|flag| acc | flag)
            .ok_or_else(|| Error::custom(format!("unknown vip flag {}", name)))
    })
}

/// Applies a provisioning file to a running control plane.
pub fn provision(lb: &mut LoadBalancer, config: &Config) -> LbResult<()> {
    for vip in &config.vips {
        let key = vip.key();
        lb.add_vip(key, vip.flags)?;
        let reals: Vec<NewReal> = vip
            .real_servers
            .iter()
            .map(|r| NewReal {
                address: r.addr,
                weight: r.weight,
            })
            .collect();
        lb.modify_reals_for_vip(ModifyAction::Add, &reals, &key)?;
        for real in vip.real_servers.iter().filter(|r| r.local) {
            lb.modify_real(&real.addr, RealFlags::LOCAL, ModifyAction::Add)?;
        }
    }
    if !config.quic_mappings.is_empty() {
        lb.modify_quic_reals_mapping(ModifyAction::Add, &config.quic_mappings)?;
    }
    for rule in &config.src_routing {
        lb.add_src_routing_rule(&rule.srcs, rule.dst)?;
    }
    for dst in &config.inline_decap_dsts {
        lb.add_inline_decap_dst(*dst)?;
    }
    for hc in &config.healthcheck_dsts {
        lb.add_healthchecker_dst(hc.id, hc.addr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
lb:
  ch_ring_size: 4096
  max_vips: 16
vips:
  - vip: 10.200.1.1
    port: 80
    proto: 17
    real_servers:
      - addr: 10.0.0.1
      - addr: 10.0.0.2
        weight: 2
  - vip: 10.200.1.5
    port: 443
    proto: udp
    flags: [quic, dport_hash]
    real_servers:
      - addr: 10.0.0.6
        local: true
quic_mappings:
  - addr: 10.0.0.1
    id: 1022
src_routing:
  - srcs: ["192.168.0.0/17"]
    dst: "fc00::2307:1"
inline_decap_dsts: ["fc00:1404::1"]
healthcheck_dsts:
  - id: 1
    addr: 10.0.0.1
"#;

    #[test]
    fn parses_provisioning_file() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.lb.ch_ring_size, 4096);
        assert_eq!(config.lb.max_reals, 4096);
        assert_eq!(config.vips.len(), 2);
        assert!(matches!(config.vips[0].proto, IpProto::Udp));
        assert_eq!(config.vips[0].real_servers[0].weight, 1);
        assert_eq!(config.vips[0].real_servers[1].weight, 2);
        assert_eq!(config.vips[1].flags, VipFlags::QUIC | VipFlags::DPORT_HASH);
        assert!(config.vips[1].real_servers[0].local);
        assert_eq!(config.quic_mappings[0].id, 1022);
        assert_eq!(config.src_routing[0].srcs, vec!["192.168.0.0/17".to_string()]);
        assert_eq!(config.healthcheck_dsts[0].id, 1);
    }

    #[test]
    fn rejects_unknown_flags_and_protocols() {
        let bad_flag = "vips:\n  - {vip: 10.0.0.1, port: 80, proto: tcp, flags: [turbo]}\n";
        assert!(Config::from_yaml(bad_flag).is_err());
        let bad_proto = "vips:\n  - {vip: 10.0.0.1, port: 80, proto: 1}\n";
        assert!(Config::from_yaml(bad_proto).is_err());
    }

    #[test]
    fn validates_ring_size() {
        let config = LbConfig {
            ch_ring_size: 1000,
            ..LbConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(LbConfig::default().validate().is_ok());
    }
}
