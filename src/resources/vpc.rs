//! VPC handler: network, subnets, routing, internet and NAT gateways.
//!
//! Layout follows `network::plan_subnets`. Public subnets route to an internet
//! gateway, private-with-NAT subnets route through the NAT gateway of their
//! availability zone (round-robin when there are fewer gateways than zones),
//! isolated subnets get no default route.

use super::{name_tag, Fragment};
use crate::core::network::{self, PlannedSubnet};
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::{SubnetTier, VpcSpec};
use serde_json::{json, Value};

fn subnet_type_tag(tier: SubnetTier) -> &'static str {
    match tier {
        SubnetTier::Public => "Public",
        SubnetTier::PrivateWithNat => "Private",
        SubnetTier::PrivateIsolated => "Isolated",
    }
}

fn availability_zone(az_index: u8) -> Value {
    json!({ "Fn::Select": [az_index, { "Fn::GetAZs": "" }] })
}

/// Synthesize a VPC declaration.
pub fn synthesize(ctx: &mut SynthContext, id: &str, spec: &VpcSpec) -> Result<Fragment, String> {
    let base = logical_id(id);
    let path = format!("{}/{}", ctx.stack, id);
    let display_name = spec.name.clone().unwrap_or_else(|| path.clone());
    let layout = network::plan_subnets(spec)?;
    let nat_hosts = network::nat_hosts(spec, &layout);
    let has_public = layout.iter().any(|s| s.tier == SubnetTier::Public);
    let vpc_ref = json!({ "Ref": base });

    let mut out: Fragment = Vec::new();
    out.push((
        base.clone(),
        CfnResource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": spec.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": name_tag(&display_name),
            }),
        ),
    ));

    let igw = format!("{}IGW", base);
    let attachment = format!("{}VPCGW", base);
    if has_public {
        out.push((
            igw.clone(),
            CfnResource::new(
                "AWS::EC2::InternetGateway",
                json!({ "Tags": name_tag(&display_name) }),
            ),
        ));
        out.push((
            attachment.clone(),
            CfnResource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({ "VpcId": vpc_ref, "InternetGatewayId": { "Ref": igw } }),
            ),
        ));
    }

    for subnet in &layout {
        out.extend(subnet_resources(
            &base,
            &path,
            subnet,
            &vpc_ref,
            &igw,
            &attachment,
            &nat_hosts,
            spec.nat_gateways,
        ));
    }

    for host in &nat_hosts {
        let subnet_id = format!("{}{}", base, host.name());
        let eip = format!("{}EIP", subnet_id);
        let tags = name_tag(&format!("{}/{}", path, host.name()));
        out.push((
            eip.clone(),
            CfnResource::new("AWS::EC2::EIP", json!({ "Domain": "vpc", "Tags": tags })),
        ));
        out.push((
            format!("{}NATGateway", subnet_id),
            CfnResource::new(
                "AWS::EC2::NatGateway",
                json!({
                    "SubnetId": { "Ref": subnet_id },
                    "AllocationId": { "Fn::GetAtt": [eip, "AllocationId"] },
                    "Tags": tags,
                }),
            )
            .with_depends_on([
                format!("{}DefaultRoute", subnet_id),
                format!("{}RouteTableAssociation", subnet_id),
            ]),
        ));
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn subnet_resources(
    base: &str,
    path: &str,
    subnet: &PlannedSubnet,
    vpc_ref: &Value,
    igw: &str,
    attachment: &str,
    nat_hosts: &[PlannedSubnet],
    nat_gateways: u8,
) -> Fragment {
    let subnet_id = format!("{}{}", base, subnet.name());
    let route_table = format!("{}RouteTable", subnet_id);
    let tags = json!([
        { "Key": "Name", "Value": format!("{}/{}", path, subnet.name()) },
        { "Key": "aws-cdk:subnet-name", "Value": subnet.group },
        { "Key": "aws-cdk:subnet-type", "Value": subnet_type_tag(subnet.tier) },
    ]);

    let mut out: Fragment = vec![
        (
            subnet_id.clone(),
            CfnResource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": vpc_ref,
                    "AvailabilityZone": availability_zone(subnet.az_index),
                    "CidrBlock": subnet.cidr.to_string(),
                    "MapPublicIpOnLaunch": subnet.tier == SubnetTier::Public,
                    "Tags": tags,
                }),
            ),
        ),
        (
            route_table.clone(),
            CfnResource::new(
                "AWS::EC2::RouteTable",
                json!({ "VpcId": vpc_ref, "Tags": name_tag(&format!("{}/{}", path, subnet.name())) }),
            ),
        ),
        (
            format!("{}RouteTableAssociation", subnet_id),
            CfnResource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": { "Ref": route_table },
                    "SubnetId": { "Ref": subnet_id },
                }),
            ),
        ),
    ];

    let default_route = format!("{}DefaultRoute", subnet_id);
    match subnet.tier {
        SubnetTier::Public => out.push((
            default_route,
            CfnResource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": { "Ref": route_table },
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": { "Ref": igw },
                }),
            )
            .with_depends_on([attachment.to_string()]),
        )),
        SubnetTier::PrivateWithNat => {
            if let Some(host) = nat_hosts.get(network::nat_for_az(subnet.az_index, nat_gateways)) {
                out.push((
                    default_route,
                    CfnResource::new(
                        "AWS::EC2::Route",
                        json!({
                            "RouteTableId": { "Ref": route_table },
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "NatGatewayId": { "Ref": format!("{}{}NATGateway", base, host.name()) },
                        }),
                    ),
                ));
            }
        }
        SubnetTier::PrivateIsolated => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{parser, synth};
    use crate::resources::test_support::bundled_stack;

    #[test]
    fn test_vpc_properties() {
        let t = bundled_stack("WipercheckVpcStack");
        let vpc = &t.resources["WipercheckVpc"];
        assert_eq!(vpc.resource_type, "AWS::EC2::VPC");
        assert_eq!(vpc.properties["EnableDnsHostnames"], true);
        assert_eq!(vpc.properties["Tags"][0]["Value"], "wipercheck-vpc");
    }

    #[test]
    fn test_subnets_spread_over_azs() {
        let t = bundled_stack("WipercheckVpcStack");
        let s1 = &t.resources["WipercheckVpcPrivateDataSubnet1"].properties;
        let s2 = &t.resources["WipercheckVpcPrivateDataSubnet2"].properties;
        assert_eq!(s1["AvailabilityZone"]["Fn::Select"][0], 0);
        assert_eq!(s2["AvailabilityZone"]["Fn::Select"][0], 1);
        assert_eq!(s1["CidrBlock"], "10.0.0.0/26");
        assert_eq!(s1["MapPublicIpOnLaunch"], false);
        assert_eq!(s1["Tags"][2]["Value"], "Private");
    }

    #[test]
    fn test_private_routes_through_single_nat() {
        let t = bundled_stack("WipercheckVpcStack");
        for az in ["1", "2"] {
            let route = &t.resources[&format!("WipercheckVpcPrivateDataSubnet{}DefaultRoute", az)];
            assert_eq!(
                route.properties["NatGatewayId"]["Ref"],
                "WipercheckVpcPublicDataSubnet1NATGateway"
            );
        }
        let public = &t.resources["WipercheckVpcPublicDataSubnet2DefaultRoute"];
        assert_eq!(public.properties["GatewayId"]["Ref"], "WipercheckVpcIGW");
        assert_eq!(public.depends_on, vec!["WipercheckVpcVPCGW"]);
    }

    #[test]
    fn test_nat_gateway_uses_eip_allocation() {
        let t = bundled_stack("WipercheckVpcStack");
        let nat = &t.resources["WipercheckVpcPublicDataSubnet1NATGateway"];
        assert_eq!(
            nat.properties["AllocationId"]["Fn::GetAtt"][0],
            "WipercheckVpcPublicDataSubnet1EIP"
        );
        assert_eq!(nat.depends_on.len(), 2);
    }

    #[test]
    fn test_isolated_vpc_has_no_gateways() {
        let yaml = r#"
version: "1.0"
name: test
env:
  account: "123456789012"
  region: us-east-1
stacks:
  Net:
    resources:
      vpc:
        type: vpc
        cidr: 10.2.0.0/24
        max_azs: 3
        subnets:
          - name: data
            cidr_mask: 28
            tier: private_isolated
"#;
        let config = parser::parse_config(yaml).unwrap();
        let templates = synth::synthesize(&config).unwrap();
        let t = &templates[0];
        assert_eq!(t.resources_of_type("AWS::EC2::Subnet").count(), 3);
        assert_eq!(t.resources_of_type("AWS::EC2::InternetGateway").count(), 0);
        assert_eq!(t.resources_of_type("AWS::EC2::Route").count(), 0);
        assert_eq!(t.resources["VpcDataSubnet3"].properties["CidrBlock"], "10.2.0.32/28");
        assert_eq!(t.resources["Vpc"].properties["Tags"][0]["Value"], "Net/vpc");
    }
}
