use outpost::ConnectConfig;

#[test]
fn probe_env() {
    let cfg = ConnectConfig::load_without_cli_args()
        .map(|c| (c.ssh_batch_mode, c.ssh_strict_host_key_checking, c.ssh_user.clone()));
    panic!("connect: {cfg:?}");
}
