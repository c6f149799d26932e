//! Merge precedence and trust gate behavior across real config files.

use ica_mcp_config::{
    load_servers_merged_with, trust_project_with, LayerOrigin, Policy, TransportSpec,
    BLOCKED_UNTRUSTED,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Scopes {
    _root: TempDir,
    project: std::path::PathBuf,
    home: std::path::PathBuf,
}

fn scopes() -> Scopes {
    let root = TempDir::new().unwrap();
    let project = root.path().join("project");
    let home = root.path().join("ica-home");
    fs::create_dir(&project).unwrap();
    fs::create_dir(&home).unwrap();
    Scopes {
        _root: root,
        project,
        home,
    }
}

fn write_config(path: &Path, value: serde_json::Value) {
    fs::write(path, value.to_string()).unwrap();
}

fn policy(home: &Path) -> Policy {
    Policy {
        home_dir: Some(home.to_path_buf()),
        ..Policy::default()
    }
}

fn last_arg(transport: &TransportSpec) -> &str {
    match transport {
        TransportSpec::Stdio { args, .. } => args.last().unwrap(),
        other => panic!("expected stdio transport, got {:?}", other),
    }
}

#[test]
fn test_project_overrides_home_by_default() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {
            "a": {"command": "python3", "args": ["-c", "print('a')"]},
            "shared": {"command": "python3", "args": ["-c", "print('project')"]}
        }}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {
            "b": {"command": "python3", "args": ["-c", "print('b')"]},
            "shared": {"command": "python3", "args": ["-c", "print('home')"]}
        }}),
    );

    let merged = load_servers_merged_with(&scopes.project, &policy(&scopes.home)).unwrap();
    assert!(merged.servers.contains_key("a"));
    assert!(merged.servers.contains_key("b"));
    assert_eq!(last_arg(&merged.servers["shared"].transport), "print('project')");
    assert_eq!(merged.servers["shared"].origin, LayerOrigin::Project);
}

#[test]
fn test_prefer_home_swaps_precedence() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {"shared": {"command": "python3", "args": ["-c", "print('project')"]}}}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"shared": {"command": "python3", "args": ["-c", "print('home')"]}}}),
    );

    let swapped = Policy {
        prefer_home: true,
        ..policy(&scopes.home)
    };
    let merged = load_servers_merged_with(&scopes.project, &swapped).unwrap();
    assert_eq!(last_arg(&merged.servers["shared"].transport), "print('home')");
}

#[test]
fn test_env_override_wins_over_both() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {"shared": {"command": "python3", "args": ["-c", "print('project')"]}}}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"shared": {"command": "python3", "args": ["-c", "print('home')"]}}}),
    );
    let override_path = scopes._root.path().join("override.json");
    write_config(
        &override_path,
        json!({"mcpServers": {"shared": {"command": "python3", "args": ["-c", "print('override')"]}}}),
    );

    for prefer_home in [false, true] {
        let merge_policy = Policy {
            prefer_home,
            env_override_path: Some(override_path.clone()),
            ..policy(&scopes.home)
        };
        let merged = load_servers_merged_with(&scopes.project, &merge_policy).unwrap();
        assert_eq!(last_arg(&merged.servers["shared"].transport), "print('override')");
        assert_eq!(merged.servers["shared"].origin, LayerOrigin::EnvOverride);
    }
}

#[test]
fn test_strict_trust_blocks_project_stdio_until_sealed() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {
            "project-stdio": {"command": "python3", "args": ["-c", "print('ok')"]},
            "project-http": {"url": "https://example.com/mcp"}
        }}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"home-stdio": {"command": "python3", "args": ["-c", "print('ok')"]}}}),
    );

    let strict = Policy {
        strict_trust: true,
        ..policy(&scopes.home)
    };

    let merged = load_servers_merged_with(&scopes.project, &strict).unwrap();
    assert!(!merged.servers.contains_key("project-stdio"));
    assert!(merged.servers.contains_key("project-http"));
    assert!(merged.servers.contains_key("home-stdio"));
    assert_eq!(merged.blocked_servers["project-stdio"], BLOCKED_UNTRUSTED);

    let record = trust_project_with(&scopes.project, &strict).unwrap();
    assert!(!record.config_digest.is_empty());

    let sealed = load_servers_merged_with(&scopes.project, &strict).unwrap();
    assert!(sealed.servers.contains_key("project-stdio"));
    assert!(sealed.blocked_servers.is_empty());
}

#[test]
fn test_allow_project_stdio_bypasses_gate_for_this_process() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {"project-stdio": {"command": "python3", "args": ["-c", "print('ok')"]}}}),
    );

    let bypass = Policy {
        strict_trust: true,
        allow_project_stdio: true,
        ..policy(&scopes.home)
    };
    let merged = load_servers_merged_with(&scopes.project, &bypass).unwrap();
    assert!(merged.servers.contains_key("project-stdio"));
    assert!(merged.blocked_servers.is_empty());
}

#[test]
fn test_editing_project_config_regates() {
    let scopes = scopes();
    let config_path = scopes.project.join(".mcp.json");
    write_config(
        &config_path,
        json!({"mcpServers": {"project-stdio": {"command": "python3", "args": ["-c", "print('ok')"]}}}),
    );

    let strict = Policy {
        strict_trust: true,
        ..policy(&scopes.home)
    };

    trust_project_with(&scopes.project, &strict).unwrap();
    let sealed = load_servers_merged_with(&scopes.project, &strict).unwrap();
    assert!(sealed.servers.contains_key("project-stdio"));

    // Any byte-level change to the project config invalidates the seal.
    write_config(
        &config_path,
        json!({"mcpServers": {"project-stdio": {"command": "python3", "args": ["-c", "print('changed')"]}}}),
    );
    let regated = load_servers_merged_with(&scopes.project, &strict).unwrap();
    assert!(!regated.servers.contains_key("project-stdio"));
    assert_eq!(regated.blocked_servers["project-stdio"], BLOCKED_UNTRUSTED);
}

#[test]
fn test_gate_ignores_home_and_env_override_stdio() {
    let scopes = scopes();
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"home-stdio": {"command": "python3"}}}),
    );
    let override_path = scopes._root.path().join("override.json");
    write_config(
        &override_path,
        json!({"mcpServers": {"op-stdio": {"command": "python3"}}}),
    );

    let strict = Policy {
        strict_trust: true,
        env_override_path: Some(override_path),
        ..policy(&scopes.home)
    };
    let merged = load_servers_merged_with(&scopes.project, &strict).unwrap();
    assert!(merged.servers.contains_key("home-stdio"));
    assert!(merged.servers.contains_key("op-stdio"));
    assert!(merged.blocked_servers.is_empty());
}

#[test]
fn test_every_layer_name_lands_in_exactly_one_mapping() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {
            "stdio-ok": {"command": "python3"},
            "no-transport": {"args": []},
            "insecure": {"url": "http://example.com/mcp"}
        }}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"home-ok": {"url": "https://example.com/mcp"}}}),
    );

    let strict = Policy {
        strict_trust: true,
        ..policy(&scopes.home)
    };
    let merged = load_servers_merged_with(&scopes.project, &strict).unwrap();

    for name in ["stdio-ok", "no-transport", "insecure", "home-ok"] {
        let in_servers = merged.servers.contains_key(name);
        let in_blocked = merged.blocked_servers.contains_key(name);
        assert!(
            in_servers ^ in_blocked,
            "{} must be in exactly one mapping (servers: {}, blocked: {})",
            name,
            in_servers,
            in_blocked
        );
    }
    assert_eq!(merged.blocked_servers["stdio-ok"], BLOCKED_UNTRUSTED);
    assert!(merged.blocked_servers["no-transport"].contains("'command' or 'url'"));
    assert!(merged.blocked_servers["insecure"].contains("insecure URL"));
}

#[test]
fn test_broken_sole_source_fails_startup() {
    let scopes = scopes();
    fs::write(scopes.project.join(".mcp.json"), "{not json").unwrap();

    let result = load_servers_merged_with(&scopes.project, &policy(&scopes.home));
    assert!(result.is_err());
}

#[test]
fn test_broken_layer_is_a_warning_when_another_source_loads() {
    let scopes = scopes();
    fs::write(scopes.project.join(".mcp.json"), "{not json").unwrap();
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"home-ok": {"command": "python3"}}}),
    );

    let merged = load_servers_merged_with(&scopes.project, &policy(&scopes.home)).unwrap();
    assert!(merged.servers.contains_key("home-ok"));
    assert_eq!(merged.warnings.len(), 1);
}

#[test]
fn test_source_digests_reported_per_layer() {
    let scopes = scopes();
    write_config(
        &scopes.project.join(".mcp.json"),
        json!({"mcpServers": {"p": {"command": "python3"}}}),
    );
    write_config(
        &scopes.home.join("mcp-servers.json"),
        json!({"mcpServers": {"h": {"command": "python3"}}}),
    );

    let merged = load_servers_merged_with(&scopes.project, &policy(&scopes.home)).unwrap();
    assert!(merged.source_digests.contains_key("project"));
    assert!(merged.source_digests.contains_key("home"));
    assert!(!merged.source_digests.contains_key("env-override"));
    assert_eq!(merged.project_digest().unwrap().len(), 64);
}
