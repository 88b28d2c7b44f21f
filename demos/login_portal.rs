use iscsi_initiator::config::{read_initiator_name, INITIATOR_NAME_FILE};
use iscsi_initiator::{LoginStatus, NodeRecord, ProviderTable, Session, SessionId, TcpTransport};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let portal = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:3260".to_string());

    let target_iqn = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "iqn.2025-12.local:storage.disk1".to_string());

    let initiator_iqn = match std::env::args().nth(3) {
        Some(name) => name,
        None => read_initiator_name(INITIATOR_NAME_FILE)
            .map(|n| n.name)
            .unwrap_or_else(|_| "iqn.2025-12.local:test-initiator".to_string()),
    };

    println!("Logging in to {} at {} as {}...", target_iqn, portal, initiator_iqn);

    let rec = NodeRecord::builder()
        .initiator_name(&initiator_iqn)
        .target_name(&target_iqn)
        .portal(&portal)
        .build()?;

    let mut providers = ProviderTable::init();
    let mut session = Session::create(SessionId(1), rec, &mut providers)?;
    session.cnx_create(0, Box::new(TcpTransport::new()))?;

    let status = session.login(0)?;
    if status != LoginStatus::Ok {
        let conn = session.connection(0);
        println!(
            "Login failed: {} (status 0x{:02x}/0x{:02x})",
            status,
            conn.map(|c| c.status_class).unwrap_or(0),
            conn.map(|c| c.status_detail).unwrap_or(0)
        );
        session.destroy(&mut providers);
        return Ok(());
    }

    println!("\nLogged in, TSIH {}", session.tsih);
    if let Some(alias) = &session.target_alias {
        println!("  TargetAlias: {}", alias);
    }
    let p = &session.params;
    println!("  MaxBurstLength: {}", p.max_burst_length);
    println!("  FirstBurstLength: {}", p.first_burst_length);
    println!("  InitialR2T: {}", p.initial_r2t);
    println!("  ImmediateData: {}", p.immediate_data);
    println!("  ErrorRecoveryLevel: {}", p.error_recovery_level);
    if let Some(conn) = session.connection(0) {
        println!("  MaxXmitDataSegmentLength: {}", conn.max_xmit_data_segment_len);
    }

    session.logout(Duration::from_secs(15))?;
    println!("\nLogged out");
    session.destroy(&mut providers);

    Ok(())
}
