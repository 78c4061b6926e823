use orc_operator::resources::{
    crd, Domain, Flavor, Image, KeyPair, Network, Port, Project, Router, RouterInterface, SecurityGroup, Server,
    Subnet, Volume,
};

fn main() -> anyhow::Result<()> {
    let resources = [
        crd::<Domain>()?,
        crd::<Flavor>()?,
        crd::<Image>()?,
        crd::<KeyPair>()?,
        crd::<Network>()?,
        crd::<Port>()?,
        crd::<Project>()?,
        crd::<Router>()?,
        crd::<RouterInterface>()?,
        crd::<SecurityGroup>()?,
        crd::<Server>()?,
        crd::<Subnet>()?,
        crd::<Volume>()?,
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }
    Ok(())
}
