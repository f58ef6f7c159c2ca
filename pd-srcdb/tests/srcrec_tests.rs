mod common;

use common::*;

#[test]
fn anchor_is_constant_across_translation_history() {
    let h = Harness::new();
    let rec = h.record(1);
    let anchor = rec.anchor();
    assert_eq!(rec.fallback_translation(), anchor);

    rec.add_translation(h.translation(32), vec![]);
    assert_eq!(rec.anchor(), anchor);
    rec.add_translation(h.translation(32), vec![]);
    rec.invalidate_all();
    assert_eq!(rec.anchor(), anchor);
    rec.add_translation(h.translation(32), vec![]);
    assert_eq!(rec.anchor(), anchor);
}

#[test]
fn insert_returns_existing_record_and_keeps_its_anchor() {
    let h = Harness::new();
    let first = h.record(7);
    let second = h.db.insert(SrcKey(7), h.stub());
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(second.anchor(), first.anchor());
    assert_eq!(h.db.len(), 1);
    assert!(h.db.find(SrcKey(8)).is_none());
}

#[test]
fn top_stays_on_first_translation_of_the_epoch() {
    let h = Harness::new();
    let rec = h.record(1);
    assert_eq!(rec.top_translation(), None);

    let t1 = h.translation(32);
    rec.add_translation(t1, vec![]);
    assert_eq!(rec.top_translation(), Some(h.entry(&t1)));

    for _ in 0..4 {
        rec.add_translation(h.translation(16), vec![]);
        assert_eq!(rec.top_translation(), Some(h.entry(&t1)));
    }
    assert_eq!(rec.translation_count(), 5);

    rec.invalidate_all();
    let t6 = h.translation(32);
    rec.add_translation(t6, vec![]);
    assert_eq!(rec.top_translation(), Some(h.entry(&t6)));
}

#[test]
fn early_site_moves_from_anchor_to_first_translation() {
    let h = Harness::new();
    let rec = h.record(1);
    let site = h.jmp_site(CodeArea::Main);

    rec.register_external_site(site);
    assert_eq!(site.target(), rec.anchor());

    let t1 = h.translation(32);
    rec.add_translation(t1, vec![]);
    assert_eq!(site.target(), h.entry(&t1));
}

#[test]
fn every_site_kind_follows_the_record() {
    let h = Harness::new();
    let rec = h.record(1);
    let sites = [
        h.jmp_site(CodeArea::Main),
        h.jcc_site(CodeArea::Cold),
        h.addr_site(),
    ];
    for site in sites {
        rec.register_external_site(site);
    }
    let t1 = h.split_translation(24, 8);
    rec.add_translation(t1, vec![]);
    for site in sites {
        assert_eq!(site.target(), h.entry(&t1), "{:?}", site.kind());
    }
    assert_eq!(rec.external_sites(), sites.to_vec());
}

#[test]
fn entry_falls_back_to_cold_code_when_main_is_empty() {
    let h = Harness::new();
    let rec = h.record(1);
    let cold = h
        .cache
        .emit(CodeArea::Cold, &[0x90; 12])
        .expect("emit cold");
    let loc = TransLoc::new(&*h.cache, CodeRange::empty(), cold, CodeRange::empty());
    let site = h.jmp_site(CodeArea::Main);
    rec.register_external_site(site);
    rec.add_translation(loc, vec![]);
    assert_eq!(site.target(), cold.start);
}

#[test]
fn previous_tail_sites_fall_through_to_the_next_translation() {
    let h = Harness::new();
    let rec = h.record(1);
    let anchor = rec.anchor();

    let t1 = h.translation(32);
    let b1 = h.tail_sites(3, anchor);
    rec.add_translation(t1, b1.clone());
    for site in &b1 {
        assert_eq!(site.target(), anchor);
    }
    assert_eq!(rec.tail_fallback_sites(), b1);

    let t2 = h.translation(32);
    let b2 = h.tail_sites(2, anchor);
    rec.add_translation(t2, b2.clone());
    for site in &b1 {
        assert_eq!(site.target(), h.entry(&t2));
    }
    for site in &b2 {
        assert_eq!(site.target(), anchor, "newest exits stay open");
    }
    assert_eq!(rec.tail_fallback_sites(), b2);

    let t3 = h.translation(32);
    rec.add_translation(t3, vec![]);
    for site in &b1 {
        assert_eq!(site.target(), h.entry(&t2), "older links are not redone");
    }
    for site in &b2 {
        assert_eq!(site.target(), h.entry(&t3));
    }
}

#[test]
fn stub_redirect_detaches_tail_sites() {
    let h = Harness::new();
    let rec = h.record(1);
    let anchor = rec.anchor();
    let stub = h.stub();

    let b1 = h.tail_sites(3, anchor);
    rec.add_translation(h.translation(32), b1.clone());
    rec.redirect_fallbacks_to_stub(stub);
    for site in &b1 {
        assert_eq!(site.target(), stub);
    }
    assert!(rec.tail_fallback_sites().is_empty());

    rec.add_translation(h.translation(32), vec![]);
    for site in &b1 {
        assert_eq!(site.target(), stub, "redirected exits are no longer chained");
    }
}

#[test]
fn invalidate_all_resets_the_epoch() {
    let h = Harness::new();
    let rec = h.record(1);
    let sites = [h.jmp_site(CodeArea::Main), h.addr_site()];
    for site in sites {
        rec.register_external_site(site);
    }
    let tails = h.tail_sites(2, rec.anchor());
    rec.add_translation(h.translation(32), vec![]);
    rec.add_translation(h.translation(32), tails);

    rec.invalidate_all();
    assert_eq!(rec.top_translation(), None);
    assert!(rec.translations().is_empty());
    assert!(rec.tail_fallback_sites().is_empty());
    for site in sites {
        assert_eq!(site.target(), rec.anchor());
    }
    assert_eq!(rec.external_sites().len(), 2, "external sites survive the reset");
}

#[test]
fn range_removal_only_touches_sites_inside_the_range() {
    let h = Harness::new();
    let rec = h.record(1);
    let sites: Vec<BranchSite> = (0..6).map(|_| h.jmp_site(CodeArea::Main)).collect();
    for site in &sites {
        rec.register_external_site(*site);
    }
    let t1 = h.translation(32);
    rec.add_translation(t1, vec![]);

    let lo = sites[1].to_smash();
    let hi = sites[4].to_smash();
    assert_eq!(rec.remove_external_sites_in_range(lo, hi), 3);

    let remaining: Vec<_> = rec.external_sites();
    assert_eq!(remaining, vec![sites[0], sites[4], sites[5]]);
    for site in &sites {
        assert_eq!(site.target(), h.entry(&t1), "targets are left alone");
    }

    assert_eq!(rec.remove_external_sites_in_range(lo, hi), 0);

    rec.invalidate_all();
    assert_eq!(sites[0].target(), rec.anchor());
    assert_eq!(sites[2].target(), h.entry(&t1), "removed sites are no longer rechained");
}

#[test]
fn single_site_removal_stops_rechaining() {
    let h = Harness::new();
    let rec = h.record(1);
    let keep = h.jmp_site(CodeArea::Main);
    let drop_me = h.jcc_site(CodeArea::Main);
    rec.register_external_site(keep);
    rec.register_external_site(drop_me);

    rec.remove_external_site(drop_me.to_smash());
    let t1 = h.translation(16);
    rec.add_translation(t1, vec![]);
    assert_eq!(keep.target(), h.entry(&t1));
    assert_eq!(drop_me.target(), rec.anchor());
}

#[test]
#[should_panic(expected = "has no incoming branch")]
fn removing_an_unknown_site_is_fatal() {
    let h = Harness::new();
    let rec = h.record(1);
    let site = h.jmp_site(CodeArea::Main);
    rec.remove_external_site(site.to_smash());
}

#[test]
fn limit_allows_one_catch_all_translation() {
    let h = Harness::with_config(SrcDbConfig {
        max_translations: 2,
        max_profile_translations: 1,
        ..SrcDbConfig::default()
    });
    let rec = h.record(1);
    rec.add_translation(h.translation(16), vec![]);
    assert!(!rec.at_translation_limit());
    rec.add_translation(h.translation(16), vec![]);
    assert!(rec.at_translation_limit());
    rec.add_translation(h.translation(16), vec![]);
    assert_eq!(rec.translation_count(), 3);
}

#[test]
#[should_panic(expected = "already holds 3 translations")]
fn exceeding_the_limit_is_fatal() {
    let h = Harness::with_config(SrcDbConfig {
        max_translations: 2,
        max_profile_translations: 1,
        ..SrcDbConfig::default()
    });
    let rec = h.record(1);
    for _ in 0..4 {
        rec.add_translation(h.translation(16), vec![]);
    }
}

#[test]
#[should_panic(expected = "not replaceable")]
fn invalidation_requires_replaceable_translations() {
    let h = Harness::with_config(SrcDbConfig {
        replaceable_translations: false,
        ..SrcDbConfig::default()
    });
    let rec = h.record(1);
    rec.add_translation(h.translation(16), vec![]);
    rec.invalidate_all();
}

#[test]
fn end_to_end_chaining_scenario() {
    let h = Harness::new();
    let rec = h.record(42);
    let a = rec.anchor();

    let b1 = h.jmp_site(CodeArea::Main);
    rec.register_external_site(b1);
    assert_eq!(b1.target(), a);

    let t1 = h.translation(48);
    rec.add_translation(t1, vec![]);
    assert_eq!(rec.top_translation(), Some(h.entry(&t1)));
    assert_eq!(b1.target(), h.entry(&t1));

    let b2 = h.jcc_site(CodeArea::Main);
    rec.register_external_site(b2);
    assert_eq!(b2.target(), h.entry(&t1));

    let t2 = h.translation(48);
    rec.add_translation(t2, vec![]);
    assert_eq!(rec.top_translation(), Some(h.entry(&t1)));
    assert_eq!(b1.target(), h.entry(&t1));
    assert_eq!(b2.target(), h.entry(&t1));

    rec.invalidate_all();
    assert_eq!(rec.top_translation(), None);
    assert!(rec.translations().is_empty());
    assert_eq!(b1.target(), a);
    assert_eq!(b2.target(), a);
}
