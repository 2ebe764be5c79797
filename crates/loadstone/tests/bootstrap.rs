use loadstone::LoadError;
use loadstone_contracts::ARTIFACT_SIGNATURE_VERSION;


use fixture::{artifact, harness, write_artifact, write_file};

#[test]
fn stdlib_fallback_installs_package_dir_and_retries() {
    let h = harness(&["lib"], |root, config| {
        config.stdlib.install_root = Some(root.join("pkgs"));
    });
    write_file(
        &h.dir("pkgs/lsstd-net-http/lib/net/http.ls"),
        b"http client",
        100,
    );

    assert!(h.loader.require_with_stdlib_fallback("net/http").unwrap());
    assert_eq!(h.executor.payloads(), vec![b"http client".to_vec()]);
    assert_eq!(h.loader.features(), vec!["net/http.ls".to_string()]);
    assert_eq!(
        h.loader.search_paths(),
        vec![h.dir("pkgs/lsstd-net-http/lib"), h.dir("lib")]
    );

    assert!(!h.loader.require_with_stdlib_fallback("net/http").unwrap());
}

#[test]
fn stdlib_fallback_reports_remediation_when_package_is_missing() {
    let h = harness(&["lib"], |root, config| {
        config.stdlib.install_root = Some(root.join("pkgs"));
    });

    let err = h.loader.require_with_stdlib_fallback("net/http").unwrap_err();
    let LoadError::PackageResolution {
        name,
        package,
        version_req,
        remediation,
    } = &err
    else {
        panic!("expected PackageResolution, got {err:?}");
    };
    assert_eq!(name, "net/http");
    assert_eq!(package, "lsstd-net-http");
    assert_eq!(version_req, "~> 1.0");
    assert!(remediation.contains("loadstone-pkg install lsstd-net-http"));
    assert_eq!(h.loader.search_paths(), vec![h.dir("lib")]);
}

#[test]
fn stdlib_fallback_does_not_mask_other_errors() {
    let h = harness(&["lib"], |root, config| {
        config.stdlib.install_root = Some(root.join("pkgs"));
    });
    write_file(&h.dir("lib/bad.ls"), b"syntax error", 100);

    let err = h.loader.require_with_stdlib_fallback("bad").unwrap_err();
    assert!(matches!(err, LoadError::Compile(_)), "{err:?}");
}

#[test]
fn package_names_join_path_segments() {
    let h = harness(&[], |_, config| {
        config.stdlib.package_prefix = "std".to_string();
        config.stdlib.join_char = '_';
    });
    assert_eq!(h.loader.stdlib_package_for("json"), "std_json");
    assert_eq!(h.loader.stdlib_package_for("net/http.lsc"), "std_net_http");
}

#[test]
fn bootstrap_scope_loads_runtime_libraries_then_restores_paths() {
    let h = harness(&["lib"], |root, config| {
        config.bootstrap.runtime_root = Some(root.join("runtime"));
    });
    write_artifact(
        &h.dir("runtime/core/lib/prelude.lsc"),
        &artifact(ARTIFACT_SIGNATURE_VERSION, "1.0.0", 0, b"prelude"),
        100,
    );
    std::fs::create_dir_all(h.dir("runtime/ext/lib")).unwrap();
    write_file(&h.dir("lib/app.ls"), b"app", 100);

    assert_eq!(
        h.loader.bootstrap_paths(),
        &[
            h.dir("runtime/core/lib"),
            h.dir("runtime/ext/lib"),
            h.dir("lib"),
        ]
    );

    let loaded = h.loader.require_in_bootstrap(&["prelude", "app"]).unwrap();
    assert_eq!(loaded, vec![true, true]);
    assert_eq!(h.compiler.count(), 1);
    assert_eq!(h.loader.search_paths(), vec![h.dir("lib")]);
    assert!(h.loader.require("prelude").is_ok_and(|loaded| !loaded));
}

#[test]
fn bootstrap_scope_restores_paths_when_a_load_fails() {
    let h = harness(&["lib"], |root, config| {
        config.bootstrap.runtime_root = Some(root.join("runtime"));
    });
    std::fs::create_dir_all(h.dir("runtime/lib")).unwrap();

    let err = h.loader.require_in_bootstrap(&["missing"]).unwrap_err();
    let LoadError::NotFound { searched_dirs, .. } = &err else {
        panic!("expected NotFound, got {err:?}");
    };
    assert_eq!(searched_dirs, &vec![h.dir("runtime/lib"), h.dir("lib")]);
    assert_eq!(h.loader.search_paths(), vec![h.dir("lib")]);

    // The scope was released, so a new one can be entered.
    let scope = h.loader.bootstrap().unwrap();
    scope.exit();
}

#[test]
fn nested_bootstrap_on_one_thread_is_rejected() {
    let h = harness(&["lib"], |_, _| {});
    let scope = h.loader.bootstrap().unwrap();
    assert!(matches!(
        h.loader.bootstrap(),
        Err(LoadError::NestedBootstrap)
    ));
    drop(scope);
    assert_eq!(h.loader.search_paths(), vec![h.dir("lib")]);
}

#[test]
fn bootstrap_list_is_memoized_across_later_path_changes() {
    let h = harness(&["lib"], |_, _| {});
    let first = h.loader.bootstrap_paths().to_vec();
    h.loader.prepend_search_path(h.dir("extra"));
    assert_eq!(h.loader.bootstrap_paths(), first.as_slice());
    assert_eq!(h.loader.search_paths(), vec![h.dir("extra"), h.dir("lib")]);
}
